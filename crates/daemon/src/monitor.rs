//! Tunnel status monitor
//!
//! Polls the driver's `status()` and logs every state change until the
//! cancellation token fires.

use crate::tunnel::TunnelDriver;
use safenet_common::TunnelState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Periodic status poller
pub struct TunnelMonitor {
    driver: Arc<TunnelDriver>,
    interval: Duration,
}

impl TunnelMonitor {
    pub fn new(driver: Arc<TunnelDriver>, interval: Duration) -> Self {
        Self { driver, interval }
    }

    /// Run until `cancel` fires; returns the last observed state
    pub async fn run(&self, cancel: CancellationToken) -> Option<TunnelState> {
        info!("Monitoring tunnel {} every {:?}", self.driver.name(), self.interval);
        let mut last: Option<TunnelState> = None;

        loop {
            match self.driver.status().await {
                Ok(state) => {
                    if last.as_ref() != Some(&state) {
                        match &state {
                            TunnelState::Error(reason) => {
                                error!("Tunnel {} entered error state: {}", self.driver.name(), reason)
                            }
                            TunnelState::Inactive if last == Some(TunnelState::Active) => {
                                warn!("Tunnel {} went down", self.driver.name())
                            }
                            _ => info!("Tunnel {} is {}", self.driver.name(), state),
                        }
                        last = Some(state);
                    } else {
                        debug!("Tunnel {} unchanged", self.driver.name());
                    }
                }
                Err(e) => {
                    error!("Status check failed: {}", e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Monitor cancelled");
                    return last;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
