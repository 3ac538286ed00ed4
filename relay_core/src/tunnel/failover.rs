//! Periodic failover: when no tunnel is active, restart everything.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tunnel::orchestrator::TunnelOrchestrator;

pub struct FailoverSupervisor {
    orchestrator: TunnelOrchestrator,
    interval: Duration,
}

impl FailoverSupervisor {
    pub fn new(orchestrator: TunnelOrchestrator, interval: Duration) -> Self {
        FailoverSupervisor {
            orchestrator,
            interval,
        }
    }

    /// True when tunnels are registered and none is connecting or connected.
    pub fn needs_failover(&self) -> bool {
        let statuses = self.orchestrator.status();
        !statuses.is_empty() && !statuses.values().any(|s| s.state.is_active())
    }

    /// One supervision step. Returns whether a restart was triggered.
    pub async fn check(&self) -> bool {
        if !self.needs_failover() {
            return false;
        }
        info!("No active tunnel, failing over");
        match self.orchestrator.restart_all().await {
            Ok(Some(name)) => info!(tunnel = %name, "Failover started tunnel"),
            Ok(None) => debug!("Failover restarted without auto-select"),
            Err(e) => warn!(error = %e, "Failover restart failed"),
        }
        true
    }

    /// Runs until `scope` or the orchestrator is cancelled.
    pub fn spawn(self, scope: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let orchestrator_scope = self.orchestrator.scope();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = orchestrator_scope.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check().await;
                    }
                }
            }
            debug!("Failover supervisor stopped");
        })
    }
}
