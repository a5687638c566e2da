use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::diff::sorted_diff;
use super::snapshot::{ChatterSnapshot, SnapshotSource};
use crate::engine::channel::Channel;
use crate::engine::events::{EventSink, MembershipEvent, MembershipKind};

/// Polling budget for the watcher.
#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    /// Time in which every watched channel should be polled once.
    pub local_budget: Duration,
    /// Minimum wait between two polls, whatever the channel count.
    pub global_min: Duration,
}

impl PollTiming {
    /// `max(global_min, ceil(local_budget / n))`, or `global_min` with no channels.
    pub fn delay_for(&self, watched: usize) -> Duration {
        if watched == 0 {
            return self.global_min;
        }
        let share = self.local_budget.as_millis().div_ceil(watched as u128);
        let share = Duration::from_millis(u64::try_from(share).unwrap_or(u64::MAX));
        share.max(self.global_min)
    }
}

/// Outcome of one poll tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing is watched.
    Idle,
    /// Snapshot stored; `events` membership changes were emitted.
    Updated { channel: Channel, events: usize },
    /// The channel was parted while its snapshot was in flight.
    Stale { channel: Channel },
    /// The snapshot source failed; nothing changed.
    Failed { channel: Channel },
}

struct WatchEntry {
    channel: Channel,
    last: Option<ChatterSnapshot>,
}

#[derive(Default)]
struct WatchState {
    /// Watch order. The cursor indexes the next channel to poll.
    entries: Vec<WatchEntry>,
    cursor: usize,
}

impl WatchState {
    fn position(&self, channel: &Channel) -> Option<usize> {
        self.entries.iter().position(|e| &e.channel == channel)
    }
}

/// Rebuilds join/part events for channels whose transport does not report
/// membership, by polling chatter lists round-robin and diffing each one
/// against the previous snapshot of the same channel.
pub struct MembershipWatcher {
    state: Mutex<WatchState>,
    source: Arc<dyn SnapshotSource>,
    sink: Arc<dyn EventSink>,
    /// Own username, lower-case.
    identity: String,
    timing: PollTiming,
    task: Mutex<Option<CancellationToken>>,
}

impl MembershipWatcher {
    pub fn new(
        channels: Vec<Channel>,
        identity: &str,
        source: Arc<dyn SnapshotSource>,
        sink: Arc<dyn EventSink>,
        timing: PollTiming,
    ) -> Self {
        let mut state = WatchState::default();
        for channel in channels {
            if state.position(&channel).is_none() {
                state.entries.push(WatchEntry { channel, last: None });
            }
        }
        Self {
            state: Mutex::new(state),
            source,
            sink,
            identity: identity.to_lowercase(),
            timing,
            task: Mutex::new(None),
        }
    }

    /// Start watching `channel`. No events are emitted for it until its
    /// second snapshot. Returns false when already watched.
    pub fn join(&self, channel: Channel) -> bool {
        let mut state = self.state.lock();
        if state.position(&channel).is_some() {
            return false;
        }
        debug!(%channel, "watching chatters");
        state.entries.push(WatchEntry { channel, last: None });
        true
    }

    /// Stop watching `channel` and forget its snapshot. The cursor keeps
    /// pointing at the same next channel, wrapping to the start if that was
    /// the removed last one.
    pub fn part(&self, channel: &Channel) -> bool {
        let mut state = self.state.lock();
        let Some(index) = state.position(channel) else {
            return false;
        };
        state.entries.remove(index);
        if state.cursor > index {
            state.cursor -= 1;
        }
        if state.cursor >= state.entries.len() {
            state.cursor = 0;
        }
        debug!(%channel, "stopped watching chatters");
        true
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.state.lock().entries.iter().map(|e| e.channel.clone()).collect()
    }

    /// Last stored snapshot for `channel`.
    pub fn chatters(&self, channel: &Channel) -> Option<ChatterSnapshot> {
        let state = self.state.lock();
        state
            .position(channel)
            .and_then(|i| state.entries[i].last.clone())
    }

    /// Channel the next tick will poll.
    pub fn next_channel(&self) -> Option<Channel> {
        let state = self.state.lock();
        state.entries.get(state.cursor).map(|e| e.channel.clone())
    }

    pub fn next_delay(&self) -> Duration {
        self.timing.delay_for(self.state.lock().entries.len())
    }

    /// Poll the channel under the cursor once.
    ///
    /// A failed fetch changes nothing, the cursor included, so the same
    /// channel is retried next tick. A channel whose fetch keeps failing
    /// therefore holds up the rest of the rotation until it is parted.
    pub async fn poll_once(&self) -> PollOutcome {
        let Some(channel) = self.next_channel() else {
            return PollOutcome::Idle;
        };

        let snapshot = match self.source.fetch(&channel).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(%channel, error = %e, "failed to fetch chatters");
                return PollOutcome::Failed { channel };
            }
        };

        let events = {
            let mut state = self.state.lock();
            let cursor = state.cursor;
            let Some(entry) = state.entries.get_mut(cursor).filter(|e| e.channel == channel)
            else {
                debug!(%channel, "channel parted while fetching chatters");
                return PollOutcome::Stale { channel };
            };

            let events = match &entry.last {
                Some(previous) => self.changes(&channel, previous, &snapshot),
                None => Vec::new(),
            };
            entry.last = Some(snapshot);
            state.cursor = (cursor + 1) % state.entries.len();
            events
        };

        // Listeners run without the state lock so they can call back into the watcher.
        for event in &events {
            event.emit_to(self.sink.as_ref());
        }

        PollOutcome::Updated {
            channel,
            events: events.len(),
        }
    }

    fn changes(
        &self,
        channel: &Channel,
        previous: &ChatterSnapshot,
        current: &ChatterSnapshot,
    ) -> Vec<MembershipEvent> {
        let categories: BTreeSet<&String> = previous
            .categories
            .keys()
            .chain(current.categories.keys())
            .collect();

        let mut events = Vec::new();
        for category in categories {
            let (gone, new) = sorted_diff(previous.category(category), current.category(category));
            let changes = gone
                .into_iter()
                .map(|u| (MembershipKind::Part, u))
                .chain(new.into_iter().map(|u| (MembershipKind::Join, u)));
            for (kind, username) in changes {
                events.push(MembershipEvent {
                    kind,
                    channel: channel.clone(),
                    is_self: username == self.identity,
                    username,
                    category: category.clone(),
                });
            }
        }
        events
    }

    /// Start the poll loop. Does nothing while it is already running.
    pub fn connect(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *task = Some(token.clone());

        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            info!(channels = watcher.channels().len(), "membership watcher started");
            loop {
                watcher.poll_once().await;
                let wait = watcher.next_delay();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            info!("membership watcher stopped");
        });
    }

    /// Cancel the pending poll. A fetch already in flight finishes on its own.
    pub fn disconnect(&self) {
        if let Some(token) = self.task.lock().take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl Drop for MembershipWatcher {
    fn drop(&mut self) {
        self.disconnect();
    }
}
