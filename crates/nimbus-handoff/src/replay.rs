//! Background delivery of held segments to their original destination.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nimbus_client::Backoff;
use nimbus_types::NodeName;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::HandoffResult;
use crate::link::{self, LinkSet};
use crate::store::{HandoffState, HandoffStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Pause between replay passes.
    pub interval: Duration,
    /// First retry delay for a destination after a failed delivery.
    pub backoff_initial: Duration,
    /// Retry delay ceiling.
    pub backoff_max: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl ReplayConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Acknowledged by the destination and deleted locally.
    pub delivered: usize,
    /// Attempted and failed; left pending.
    pub failed: usize,
    /// Skipped because the destination is backing off or unknown.
    pub deferred: usize,
}

#[derive(Debug)]
struct DestinationBackoff {
    backoff: Backoff,
    retry_at: Instant,
}

/// Replays pending handoff records to their original destination.
#[derive(Debug)]
pub struct HandoffReplayer {
    config: ReplayConfig,
    store: Arc<HandoffStore>,
    writers: LinkSet,
    backoffs: HashMap<NodeName, DestinationBackoff>,
}

impl HandoffReplayer {
    pub fn new(config: ReplayConfig, store: Arc<HandoffStore>, writers: LinkSet) -> Self {
        Self {
            config,
            store,
            writers,
            backoffs: HashMap::new(),
        }
    }

    /// Makes one pass over the pending records.
    ///
    /// Each delivery is an `archive-key-entire` to the destination's writer.
    /// Delivering the same record twice is harmless: the destination keeps
    /// whichever write carries the newest timestamp.
    pub fn run_once(&mut self) -> HandoffResult<ReplayStats> {
        let mut stats = ReplayStats::default();

        for (id, record) in self.store.pending()? {
            let destination = &record.original_destination;

            if self.backing_off(destination) {
                stats.deferred += 1;
                continue;
            }
            let Some(writer) = self.writers.get(destination).cloned() else {
                warn!(destination = %destination, "no writer link for handoff destination");
                stats.deferred += 1;
                continue;
            };

            self.store.set_state(&id, HandoffState::Forwarded, false)?;
            match link::archive_entire(writer.as_ref(), &record.segment, &record.data) {
                Ok(_) => {
                    self.store.set_state(&id, HandoffState::Acknowledged, false)?;
                    self.store.remove(&id)?;
                    self.backoffs.remove(destination);
                    stats.delivered += 1;
                    info!(
                        destination = %destination,
                        tenant = %record.segment.tenant_id,
                        key = %record.segment.key,
                        segment = record.segment.segment_number,
                        "replayed handoff"
                    );
                }
                Err(e) => {
                    self.store.set_state(&id, HandoffState::Pending, true)?;
                    let delay = self.schedule_retry(destination);
                    stats.failed += 1;
                    debug!(
                        destination = %destination,
                        attempts = record.attempts + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "handoff replay failed"
                    );
                }
            }
        }

        Ok(stats)
    }

    /// Replays until `shutdown` is set. Store failures are logged and the
    /// pass retried on the next interval.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        const SLICE: Duration = Duration::from_millis(20);

        while !shutdown.load(Ordering::SeqCst) {
            match self.run_once() {
                Ok(stats) if stats.delivered > 0 || stats.failed > 0 => {
                    debug!(
                        delivered = stats.delivered,
                        failed = stats.failed,
                        deferred = stats.deferred,
                        "replay pass"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "replay pass failed"),
            }

            let deadline = Instant::now() + self.config.interval;
            while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
                thread::sleep(SLICE.min(deadline.saturating_duration_since(Instant::now())));
            }
        }
    }

    fn backing_off(&self, destination: &NodeName) -> bool {
        self.backoffs
            .get(destination)
            .is_some_and(|b| Instant::now() < b.retry_at)
    }

    fn schedule_retry(&mut self, destination: &NodeName) -> Duration {
        let config = &self.config;
        let entry = self
            .backoffs
            .entry(destination.clone())
            .or_insert_with(|| DestinationBackoff {
                backoff: Backoff::new(config.backoff_initial, config.backoff_max),
                retry_at: Instant::now(),
            });
        let delay = entry.backoff.next_delay();
        entry.retry_at = Instant::now() + delay;
        delay
    }
}
