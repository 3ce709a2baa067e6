//! Declarative access policy
//!
//! A policy document has two top-level keys:
//!
//! ```yaml
//! devices:
//!   - name: laptop-01
//!     groups: [staff]
//!   - name: nas_01
//!     groups: [servers]
//! access_rules:
//!   - { from: staff, to: servers, action: allow }
//! ```
//!
//! The document is parsed with `serde_yaml` into an untyped `Value` (YAML
//! tags never construct arbitrary objects) and then walked by `validate`,
//! which produces the closed `SafeNetPolicy` model. Nothing downstream sees
//! the untyped form. Unknown keys are ignored; bad names, duplicate devices,
//! empty groups and dangling rule references reject the whole document.

use crate::name::{validate_name, DeviceName};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// A device declared by the policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub name: DeviceName,
    pub groups: BTreeSet<String>,
}

/// Rule action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => write!(f, "allow"),
            Action::Deny => write!(f, "deny"),
        }
    }
}

/// Intended east-west reachability between two groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub from_group: String,
    pub to_group: String,
    pub action: Action,
}

/// Validated, immutable policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafeNetPolicy {
    devices: Vec<DeviceNode>,
    access_rules: Vec<AccessRule>,
}

impl SafeNetPolicy {
    pub fn devices(&self) -> &[DeviceNode] {
        &self.devices
    }

    pub fn access_rules(&self) -> &[AccessRule] {
        &self.access_rules
    }

    pub fn device(&self, name: &str) -> Option<&DeviceNode> {
        self.devices.iter().find(|d| d.name.as_str() == name)
    }

    /// Every group label referenced by at least one device
    pub fn groups(&self) -> BTreeSet<String> {
        self.devices
            .iter()
            .flat_map(|d| d.groups.iter().cloned())
            .collect()
    }

    /// Whether traffic from `from_group` to `to_group` is permitted.
    ///
    /// The first rule matching the pair decides; no match means deny.
    pub fn is_allowed(&self, from_group: &str, to_group: &str) -> bool {
        self.access_rules
            .iter()
            .find(|r| r.from_group == from_group && r.to_group == to_group)
            .map(|r| r.action == Action::Allow)
            .unwrap_or(false)
    }
}

/// Structured rejection naming the offending field and value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub value: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (got {:?})", self.field, self.reason, self.value)
    }
}

impl std::error::Error for ValidationError {}

/// Parse and validate policy text
pub fn parse_policy(text: &str) -> Result<SafeNetPolicy> {
    let raw: Value = serde_yaml::from_str(text)?;
    Ok(validate(&raw)?)
}

/// Read, parse and validate a policy file
pub async fn load_policy(path: impl AsRef<Path>) -> Result<SafeNetPolicy> {
    let text = tokio::fs::read_to_string(path.as_ref()).await?;
    let policy = parse_policy(&text)?;
    debug!(
        "Loaded policy from {:?}: {} devices, {} rules",
        path.as_ref(),
        policy.devices.len(),
        policy.access_rules.len()
    );
    Ok(policy)
}

/// Validate an untyped policy document
pub fn validate(raw: &Value) -> std::result::Result<SafeNetPolicy, ValidationError> {
    let root = raw
        .as_mapping()
        .ok_or_else(|| ValidationError::new("$", describe(raw), "policy must be a mapping"))?;

    let devices = match get(root, "devices") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(items)) => {
            let mut devices = Vec::with_capacity(items.len());
            let mut seen = HashSet::new();
            for (i, item) in items.iter().enumerate() {
                let device = validate_device(i, item)?;
                if !seen.insert(device.name.clone()) {
                    return Err(ValidationError::new(
                        format!("devices[{}].name", i),
                        device.name.as_str(),
                        "duplicate device name",
                    ));
                }
                devices.push(device);
            }
            devices
        }
        Some(other) => {
            return Err(ValidationError::new("devices", describe(other), "must be a sequence"))
        }
    };

    let declared: BTreeSet<&str> = devices
        .iter()
        .flat_map(|d| d.groups.iter().map(String::as_str))
        .collect();

    let access_rules = match get(root, "access_rules") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| validate_rule(i, item, &declared))
            .collect::<std::result::Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(ValidationError::new(
                "access_rules",
                describe(other),
                "must be a sequence",
            ))
        }
    };

    Ok(SafeNetPolicy { devices, access_rules })
}

fn validate_device(index: usize, item: &Value) -> std::result::Result<DeviceNode, ValidationError> {
    let field = format!("devices[{}]", index);
    let map = item
        .as_mapping()
        .ok_or_else(|| ValidationError::new(&field, describe(item), "device must be a mapping"))?;

    let name_field = format!("{}.name", field);
    let raw_name = match get(map, "name") {
        Some(Value::String(s)) => s,
        Some(other) => return Err(ValidationError::new(name_field, describe(other), "must be a string")),
        None => return Err(ValidationError::new(name_field, "", "missing device name")),
    };
    let name = validate_name(raw_name)
        .map_err(|e| ValidationError::new(&name_field, raw_name.as_str(), e.to_string()))?;

    let groups_field = format!("{}.groups", field);
    let groups = match get(map, "groups") {
        None | Some(Value::Null) => BTreeSet::new(),
        Some(Value::Sequence(items)) => {
            let mut groups = BTreeSet::new();
            for (j, g) in items.iter().enumerate() {
                let label = group_label(&format!("{}[{}]", groups_field, j), g)?;
                groups.insert(label);
            }
            groups
        }
        Some(other) => {
            return Err(ValidationError::new(groups_field, describe(other), "must be a sequence"))
        }
    };

    Ok(DeviceNode { name, groups })
}

fn validate_rule(
    index: usize,
    item: &Value,
    declared: &BTreeSet<&str>,
) -> std::result::Result<AccessRule, ValidationError> {
    let field = format!("access_rules[{}]", index);
    let map = item
        .as_mapping()
        .ok_or_else(|| ValidationError::new(&field, describe(item), "rule must be a mapping"))?;

    let endpoint = |key: &str| -> std::result::Result<String, ValidationError> {
        let f = format!("{}.{}", field, key);
        let value = get(map, key).ok_or_else(|| ValidationError::new(&f, "", "missing group reference"))?;
        let label = group_label(&f, value)?;
        if !declared.contains(label.as_str()) {
            return Err(ValidationError::new(f, label, "references an undeclared group"));
        }
        Ok(label)
    };
    let from_group = endpoint("from")?;
    let to_group = endpoint("to")?;

    let action_field = format!("{}.action", field);
    let action = match get(map, "action") {
        Some(Value::String(s)) if s == "allow" => Action::Allow,
        Some(Value::String(s)) if s == "deny" => Action::Deny,
        Some(other) => {
            return Err(ValidationError::new(
                action_field,
                describe(other),
                "action must be 'allow' or 'deny'",
            ))
        }
        None => return Err(ValidationError::new(action_field, "", "missing action")),
    };

    Ok(AccessRule { from_group, to_group, action })
}

fn group_label(field: &str, value: &Value) -> std::result::Result<String, ValidationError> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        Value::String(s) => Err(ValidationError::new(field, s.as_str(), "group label must not be empty")),
        other => Err(ValidationError::new(field, describe(other), "group label must be a string")),
    }
}

fn get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(key)
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Sequence(_) => "<sequence>".to_string(),
        Value::Mapping(_) => "<mapping>".to_string(),
        Value::Tagged(t) => format!("<tagged {}>", t.tag),
    }
}
