//! Pass triggers
//!
//! Passes run on a cron schedule. Each tick runs exactly one pass; a tick
//! that fires while a pass is still running is skipped, so passes never
//! overlap. Pass errors are logged and the next tick tries again.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use tracing::{debug, error, info, warn};

use crate::controller::{ControllerState, PassReport};
use crate::error::{Error, Result};

/// Every minute, on the minute
pub const DEFAULT_SCHEDULE: &str = "0 * * * * *";

/// Parse a six-field cron expression (seconds first).
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr)
        .map_err(|e| Error::ConfigError(format!("invalid schedule {:?}: {}", expr, e)))
}

/// Run a single pass and return its report.
pub async fn run_once(state: &ControllerState) -> Result<PassReport> {
    state.reconcile().await
}

/// Run passes on `schedule` until ctrl-c.
pub async fn run_scheduled(state: Arc<ControllerState>, schedule: Schedule) -> Result<()> {
    info!("Reconciling on schedule {}", schedule);

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("Schedule {} has no upcoming ticks, stopping", schedule);
            return Ok(());
        };
        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        debug!("Next pass at {} (in {:?})", next, wait);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, stopping reconciler");
                return Ok(());
            }
        }

        match state.reconcile().await {
            Ok(report) => debug!(
                "Pass took {}ms, {} nodes changed",
                report.duration_ms,
                report.applied()
            ),
            Err(e) if e.is_retriable() => warn!("Pass failed, retrying next tick: {}", e),
            Err(e) => error!("Pass failed: {}", e),
        }
    }
}
