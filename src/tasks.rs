use std::panic::AssertUnwindSafe;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Spawn a fixed-interval background job that runs until `shutdown` is cancelled.
///
/// The first tick is skipped so the job never runs at startup. A panic inside
/// one run is caught and logged; the timer keeps ticking afterwards.
pub fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if std::panic::catch_unwind(AssertUnwindSafe(&mut job)).is_err() {
                        error!(task = name, "Background task panicked, continuing on next tick");
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!(task = name, "Background task shutting down");
                    break;
                }
            }
        }
    })
}
