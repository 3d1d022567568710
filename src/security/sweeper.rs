//! Periodic maintenance of the admission stores.
//!
//! Three independent loops, each touching only its own component:
//! - denylist: drop expired bans
//! - activity: forget every suspicion counter (full reset, not a decay)
//! - visitors: drop idle rate-limit visitors and finished volume windows

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pipeline::AdmissionPipeline;
use crate::config::SweeperConfig;

pub struct Sweepers {
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Sweepers {
    /// Spawn the sweep loops on the current tokio runtime.
    pub fn start(pipeline: &AdmissionPipeline, config: &SweeperConfig) -> Self {
        let cancellation_token = CancellationToken::new();

        let reputation = pipeline.reputation().clone();
        let escalator = pipeline.escalator().clone();
        let limiter = pipeline.limiter().clone();
        let volume = pipeline.volume().clone();
        let idle = config.visitor_idle();

        let handles = vec![
            spawn_sweep(
                "denylist",
                config.denylist_interval(),
                cancellation_token.clone(),
                move || reputation.purge_expired(),
            ),
            spawn_sweep(
                "activity",
                config.activity_interval(),
                cancellation_token.clone(),
                move || escalator.reset_all(),
            ),
            spawn_sweep(
                "visitors",
                config.visitor_interval(),
                cancellation_token.clone(),
                move || limiter.sweep_idle(idle) + volume.sweep(),
            ),
        ];

        tracing::info!(
            denylist_secs = config.denylist_interval().as_secs(),
            activity_secs = config.activity_interval().as_secs(),
            visitor_secs = config.visitor_interval().as_secs(),
            "Background sweepers started"
        );

        Self {
            cancellation_token,
            handles,
        }
    }

    /// Stop every loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Sweeper task ended abnormally");
            }
        }
        tracing::info!("Background sweepers stopped");
    }
}

fn spawn_sweep<F>(
    name: &'static str,
    period: Duration,
    cancellation_token: CancellationToken,
    sweep: F,
) -> JoinHandle<()>
where
    F: Fn() -> usize + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // First tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = interval.tick() => {
                    let removed = sweep();
                    tracing::debug!(sweeper = name, removed, "Sweep completed");
                }
            }
        }
    })
}
