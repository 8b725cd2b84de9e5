//! Periodic refresh loop.
//!
//! An explicit loop over a tokio interval; nothing global is registered. A run
//! in progress always finishes, and shutdown is observed between runs.

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{info, instrument, warn};

/// Call `job` every `interval`, starting after `first_delay`, until Ctrl-C.
pub async fn run_every<F, Fut>(interval: Duration, first_delay: Duration, job: F) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C; scheduler will run until killed");
            std::future::pending::<()>().await;
        }
    };
    run_until(interval, first_delay, ctrl_c, job).await
}

/// Like [`run_every`], stopping when `shutdown` resolves. Returns how many
/// runs were started.
#[instrument(level = "info", skip_all, fields(interval_secs = interval.as_secs()))]
pub async fn run_until<S, F, Fut>(interval: Duration, first_delay: Duration, shutdown: S, mut job: F) -> usize
where
    S: Future<Output = ()>,
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval_at(Instant::now() + first_delay, interval.max(Duration::from_millis(1)));
    // a run longer than the interval pushes the schedule back instead of bursting
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut runs = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!(runs, "Scheduler stopping");
                return runs;
            }
            _ = ticker.tick() => {
                runs += 1;
                info!(run = runs, "Scheduled run starting");
                job().await;
            }
        }
    }
}
