use super::{ChangeFeed, FeedError};
use crate::services::activation_service::{ActivationService, ActivationState};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Tracks in-flight feed positions and yields the acknowledgement watermark.
///
/// Events start in increasing `seq` order but may finish in any order. The
/// watermark is the highest `seq` such that every started event at or below
/// it has finished.
#[derive(Debug, Default)]
pub struct AckTracker {
    in_flight: BTreeSet<i64>,
    highest_started: i64,
    acknowledged: i64,
}

impl AckTracker {
    pub fn start(&mut self, seq: i64) {
        self.in_flight.insert(seq);
        self.highest_started = self.highest_started.max(seq);
    }

    /// Mark `seq` finished. Returns the new watermark when it advanced.
    pub fn finish(&mut self, seq: i64) -> Option<i64> {
        self.in_flight.remove(&seq);

        let watermark = match self.in_flight.first() {
            Some(&lowest) => lowest - 1,
            None => self.highest_started,
        };

        if watermark > self.acknowledged {
            self.acknowledged = watermark;
            Some(watermark)
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ListenerStats {
    pub received: u64,
    pub ignored: u64,
    pub completed: u64,
    pub failed: u64,
    pub acknowledged: Option<i64>,
    /// Positions whose task panicked. They hold the watermark back until restart.
    pub aborted: Vec<i64>,
}

/// Runs one activation task per delivered event, concurrently, until the
/// feed closes or shutdown is requested. In-flight tasks are always drained
/// before returning.
pub struct ChangeListener {
    feed: Arc<dyn ChangeFeed>,
    service: Arc<ActivationService>,
    namespace: String,
}

impl ChangeListener {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        service: Arc<ActivationService>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            feed,
            service,
            namespace: namespace.into(),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<ListenerStats, FeedError> {
        let mut events = self.feed.subscribe(&self.namespace).await?;
        let mut tasks = JoinSet::new();
        let mut positions: HashMap<Id, i64> = HashMap::new();
        let mut tracker = AckTracker::default();
        let mut stats = ListenerStats::default();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested; draining {} task(s)", tracker.in_flight());
                    break;
                }
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    self.finish(joined, &mut positions, &mut tracker, &mut stats).await;
                }
                received = events.recv() => match received {
                    Some(event) => {
                        stats.received += 1;
                        tracker.start(event.seq);
                        let seq = event.seq;
                        let service = self.service.clone();
                        let handle = tasks.spawn(async move {
                            service.handle_event(&event).await.final_state()
                        });
                        positions.insert(handle.id(), seq);
                    }
                    None => {
                        tracing::info!("Change feed for {} closed", self.namespace);
                        break;
                    }
                },
            }
        }

        drop(events);
        while let Some(joined) = tasks.join_next_with_id().await {
            self.finish(joined, &mut positions, &mut tracker, &mut stats).await;
        }

        Ok(stats)
    }

    async fn finish(
        &self,
        joined: Result<(Id, ActivationState), JoinError>,
        positions: &mut HashMap<Id, i64>,
        tracker: &mut AckTracker,
        stats: &mut ListenerStats,
    ) {
        let (seq, state) = match joined {
            Ok((id, state)) => match positions.remove(&id) {
                Some(seq) => (seq, state),
                None => {
                    tracing::error!("Finished activation task {} has no position", id);
                    return;
                }
            },
            Err(e) => {
                stats.failed += 1;
                // The position stays in flight, so it is redelivered after a restart.
                match positions.remove(&e.id()) {
                    Some(seq) => {
                        tracing::error!(
                            "Activation task for seq {} aborted, acknowledgement held at {:?}: {}",
                            seq,
                            stats.acknowledged,
                            e
                        );
                        stats.aborted.push(seq);
                    }
                    None => tracing::error!("Activation task {} aborted: {}", e.id(), e),
                }
                return;
            }
        };

        match state {
            ActivationState::Idle => stats.ignored += 1,
            ActivationState::Failed => stats.failed += 1,
            _ => stats.completed += 1,
        }

        if let Some(watermark) = tracker.finish(seq) {
            match self.feed.acknowledge(&self.namespace, watermark).await {
                Ok(()) => stats.acknowledged = Some(watermark),
                Err(e) => tracing::warn!("Failed to acknowledge seq {}: {}", watermark, e),
            }
        }
    }
}
