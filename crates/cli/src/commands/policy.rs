//! Policy Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use std::path::PathBuf;

use crate::output::{print_list, print_success, OutputFormat, TableDisplay};
use safenet_common::policy::load_policy;
use safenet_common::{AccessRule, DeviceNode, SafeNetPolicy};
use safenet_daemon::ControlPlane;

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Validate a policy document without touching the store
    Validate {
        /// Policy file (YAML)
        file: PathBuf,
    },

    /// Validate a policy document and record its groups
    Apply {
        /// Policy file (YAML)
        file: PathBuf,
    },

    /// List the groups declared by the applied policy
    Groups,
}

/// Group display wrapper
#[derive(Serialize)]
pub struct GroupDisplay {
    pub group: String,
}

impl TableDisplay for GroupDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Group"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.group.clone()]
    }
}

/// Device display wrapper for serialization
#[derive(Serialize)]
pub struct DeviceDisplay {
    pub name: String,
    pub groups: Vec<String>,
}

impl From<&DeviceNode> for DeviceDisplay {
    fn from(device: &DeviceNode) -> Self {
        Self {
            name: device.name.to_string(),
            groups: device.groups.iter().cloned().collect(),
        }
    }
}

impl TableDisplay for DeviceDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Device", "Groups"]
    }

    fn row(&self) -> Vec<String> {
        vec![self.name.clone(), self.groups.join(", ")]
    }
}

impl TableDisplay for AccessRule {
    fn headers() -> Vec<&'static str> {
        vec!["From", "To", "Action"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.from_group.clone(),
            self.to_group.clone(),
            self.action.to_string(),
        ]
    }
}

fn print_policy(policy: &SafeNetPolicy, format: OutputFormat) {
    let devices: Vec<DeviceDisplay> = policy.devices().iter().map(DeviceDisplay::from).collect();
    print_list(&devices, format);
    if matches!(format, OutputFormat::Table | OutputFormat::Plain) {
        println!();
    }
    print_list(policy.access_rules(), format);
}

/// Run a command that needs no store
pub async fn validate(file: PathBuf, format: OutputFormat) -> Result<()> {
    let policy = load_policy(&file).await?;
    print_policy(&policy, format);
    print_success(&format!(
        "{:?} is valid: {} devices, {} rules",
        file,
        policy.devices().len(),
        policy.access_rules().len()
    ));
    Ok(())
}

pub async fn execute(cmd: PolicyCommands, plane: &ControlPlane, format: OutputFormat) -> Result<()> {
    match cmd {
        PolicyCommands::Validate { file } => validate(file, format).await?,

        PolicyCommands::Apply { file } => {
            let policy = plane.apply_policy_file(&file).await?;
            print_policy(&policy, format);
            print_success(&format!(
                "Applied {:?}: {} groups recorded",
                file,
                policy.groups().len()
            ));
        }

        PolicyCommands::Groups => {
            let groups: Vec<GroupDisplay> = plane
                .declared_groups()
                .await?
                .into_iter()
                .map(|group| GroupDisplay { group })
                .collect();
            print_list(&groups, format);
        }
    }

    Ok(())
}
