//! Device and peer name validation
//!
//! Names must be:
//! - 3-32 characters
//! - [A-Za-z0-9_-] characters only
//!
//! The same rule applies to policy devices, enrolled peers and the tunnel
//! name itself. A `DeviceName` can only be obtained through `validate_name`,
//! so any value of that type is safe to hand to a renderer or to a process
//! argument list.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_NAME_LEN: usize = 3;
pub const MAX_NAME_LEN: usize = 32;

/// Name validation error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    TooShort { min: usize, got: usize },
    TooLong { max: usize, got: usize },
    InvalidCharacter { position: usize, char: char },
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort { min, got } => {
                write!(f, "Name must be at least {} characters (got {})", min, got)
            }
            Self::TooLong { max, got } => {
                write!(f, "Name must be at most {} characters (got {})", max, got)
            }
            Self::InvalidCharacter { position, char } => {
                write!(
                    f,
                    "Invalid character {:?} at position {}. Only letters, numbers, dashes and underscores are allowed.",
                    char, position
                )
            }
        }
    }
}

impl std::error::Error for NameError {}

/// A validated device, peer or tunnel name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceName(String);

impl DeviceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<std::ffi::OsStr> for DeviceName {
    fn as_ref(&self) -> &std::ffi::OsStr {
        std::ffi::OsStr::new(&self.0)
    }
}

impl TryFrom<String> for DeviceName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_name(&value)
    }
}

impl std::str::FromStr for DeviceName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_name(s)
    }
}

impl From<DeviceName> for String {
    fn from(name: DeviceName) -> Self {
        name.0
    }
}

/// Validate a device name
///
/// Case is preserved; `Laptop-01` and `laptop-01` are distinct names.
pub fn validate_name(name: &str) -> Result<DeviceName, NameError> {
    // Character check first so multi-byte input reports the offending char
    // instead of a misleading byte length.
    for (i, c) in name.chars().enumerate() {
        if !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-') {
            return Err(NameError::InvalidCharacter { position: i, char: c });
        }
    }

    let len = name.len();
    if len < MIN_NAME_LEN {
        return Err(NameError::TooShort { min: MIN_NAME_LEN, got: len });
    }
    if len > MAX_NAME_LEN {
        return Err(NameError::TooLong { max: MAX_NAME_LEN, got: len });
    }

    Ok(DeviceName(name.to_string()))
}
