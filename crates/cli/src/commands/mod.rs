//! CLI Commands

pub mod peer;
pub mod policy;
pub mod tunnel;
