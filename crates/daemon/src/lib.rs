//! SafeNet Daemon
//!
//! Tunnel lifecycle and enrollment control plane. The `safenetd` binary and
//! the `safenet` CLI are thin front ends over `ControlPlane`.

pub mod backend;
pub mod config;
pub mod control;
pub mod monitor;
pub mod process;
pub mod tunnel;

pub use backend::Backend;
pub use config::SafenetConfig;
pub use control::{ControlPlane, Enrollment, EnrollmentResponse};
pub use monitor::TunnelMonitor;
pub use process::{Invocation, ProcessOutput, ProcessRunner, TokioRunner};
pub use tunnel::TunnelDriver;

/// Initialize tracing with `RUST_LOG`, falling back to `info`
pub fn init_logging(debug: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
