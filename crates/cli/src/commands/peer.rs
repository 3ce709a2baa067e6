//! Peer Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use std::path::PathBuf;

use crate::output::{print_item, print_list, print_success, print_warning, OutputFormat, TableDisplay};
use safenet_common::keys::write_private_file;
use safenet_common::Peer;
use safenet_daemon::{ControlPlane, EnrollmentResponse};

#[derive(Subcommand)]
pub enum PeerCommands {
    /// Enroll a device and print its one-time client configuration
    Enroll {
        /// Device name (3-32 of A-Z a-z 0-9 _ -)
        name: String,

        /// Write the client configuration to this file (mode 0600) instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List enrolled peers
    List,

    /// Show a peer
    Show {
        /// Peer name
        name: String,
    },

    /// Replace a device's group memberships (groups must be declared by the policy)
    Groups {
        /// Device name
        name: String,

        /// Group labels
        groups: Vec<String>,
    },

    /// Remove a peer and free its address
    Remove {
        /// Peer name
        name: String,
    },
}

/// Peer display wrapper for serialization
#[derive(Serialize)]
pub struct PeerDisplay {
    pub name: String,
    pub address: String,
    pub public_key: String,
    pub groups: Vec<String>,
    pub created: String,
}

impl From<Peer> for PeerDisplay {
    fn from(peer: Peer) -> Self {
        let created = chrono::DateTime::from_timestamp(peer.created_at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| peer.created_at.to_string());

        Self {
            name: peer.name.to_string(),
            address: peer.address.to_string(),
            public_key: peer.public_key.to_string(),
            groups: peer.groups,
            created,
        }
    }
}

impl TableDisplay for PeerDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Address", "Public Key", "Groups", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.clone(),
            self.address.clone(),
            self.public_key.clone(),
            self.groups.join(", "),
            self.created.clone(),
        ]
    }
}

/// Enrollment summary without secret material
#[derive(Serialize)]
struct EnrolledDisplay<'a> {
    name: &'a str,
    assigned_address: &'a str,
    public_key: &'a str,
}

impl TableDisplay for EnrolledDisplay<'_> {
    fn headers() -> Vec<&'static str> {
        vec!["Name", "Address", "Public Key"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.name.to_string(),
            self.assigned_address.to_string(),
            self.public_key.to_string(),
        ]
    }
}

fn print_enrollment(response: &EnrollmentResponse, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(response).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(response).unwrap_or_default());
        }
        OutputFormat::Table | OutputFormat::Plain => {
            print_item(&summary(response), format);
            println!();
            print!("{}", response.rendered_config);
            println!();
            print_warning("This is the only time the private key is shown. Store it now.");
        }
    }
}

fn summary(response: &EnrollmentResponse) -> EnrolledDisplay<'_> {
    EnrolledDisplay {
        name: &response.name,
        assigned_address: &response.assigned_address,
        public_key: &response.public_key,
    }
}

pub async fn execute(cmd: PeerCommands, plane: &ControlPlane, format: OutputFormat) -> Result<()> {
    match cmd {
        PeerCommands::Enroll { name, output } => {
            let response = plane.enroll(&name).await?.into_response();
            match output {
                Some(path) => {
                    write_private_file(&path, response.rendered_config.as_bytes()).await?;
                    print_item(&summary(&response), format);
                    print_success(&format!(
                        "Enrolled {} at {}; client config written to {:?}",
                        response.name, response.assigned_address, path
                    ));
                }
                None => print_enrollment(&response, format),
            }
        }

        PeerCommands::List => {
            let peers = plane.list_peers().await?;
            let displays: Vec<PeerDisplay> = peers.into_iter().map(PeerDisplay::from).collect();
            print_list(&displays, format);
        }

        PeerCommands::Show { name } => {
            let peer = plane.get_peer(&name).await?;
            print_item(&PeerDisplay::from(peer), format);
        }

        PeerCommands::Groups { name, groups } => {
            let summary = groups.join(", ");
            plane.assign_groups(&name, groups).await?;
            print_success(&format!("{} is now in [{}]", name, summary));
        }

        PeerCommands::Remove { name } => {
            plane.remove_peer(&name).await?;
            print_success(&format!("Peer {} removed", name));
        }
    }

    Ok(())
}
