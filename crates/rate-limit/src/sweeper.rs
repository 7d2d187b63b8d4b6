use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ratekeeper_common::{RatekeeperError, RatekeeperResult};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::store::BucketStore;

/// Handle to the background task that evicts idle buckets.
///
/// The task stops when [`Sweeper::stop`] is called or the handle is dropped.
#[derive(Debug)]
pub(crate) struct Sweeper {
    shutdown: watch::Sender<bool>,
}

impl Sweeper {
    /// Start sweeping `store` every `interval`.
    ///
    /// Runs on the current tokio runtime if there is one, otherwise on a
    /// dedicated thread with its own single-threaded runtime. A task on the
    /// current runtime dies with that runtime, after which nothing is
    /// evicted any more.
    pub(crate) fn spawn(
        store: Arc<BucketStore>,
        interval: Duration,
        idle_timeout: Duration,
    ) -> RatekeeperResult<Self> {
        let (shutdown, signal) = watch::channel(false);
        let task = run(store, interval, idle_timeout, signal);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
            }
            Err(_) => spawn_thread(task)?,
        }

        Ok(Self { shutdown })
    }

    /// Signal the task to exit. Safe to call any number of times.
    pub(crate) fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            info!("bucket sweeper stop requested");
        }
    }
}

fn spawn_thread(task: impl Future<Output = ()> + Send + 'static) -> RatekeeperResult<()> {
    std::thread::Builder::new()
        .name("rate-limit-sweeper".into())
        .spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime.block_on(task),
                Err(e) => error!(error = %e, "failed to build sweeper runtime"),
            }
        })
        .map_err(RatekeeperError::Spawn)?;
    Ok(())
}

async fn run(
    store: Arc<BucketStore>,
    interval: Duration,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // a dropped sender also means stop
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                sweep(&store, idle_timeout, Instant::now());
            }
        }
    }

    debug!("bucket sweeper stopped");
}

/// Remove every bucket whose last allowed request is at least
/// `idle_timeout` before `now`. Returns how many were removed.
///
/// Idleness is checked again at removal time, so a bucket refreshed after
/// the scan is kept.
pub(crate) fn sweep(store: &BucketStore, idle_timeout: Duration, now: Instant) -> usize {
    let mut idle = Vec::new();
    store.range(|key, bucket| {
        if bucket.idle_for(now) >= idle_timeout {
            idle.push(key.to_owned());
        }
        true
    });

    let evicted = idle
        .iter()
        .filter(|key| store.delete_if(key.as_str(), |bucket| bucket.idle_for(now) >= idle_timeout))
        .count();

    debug!(evicted, remaining = store.len(), "bucket sweep complete");
    evicted
}
