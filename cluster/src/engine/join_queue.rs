use std::collections::VecDeque;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::channel::Channel;
use super::pool::ConnectionPool;

/// Channels waiting to be joined, earliest request first.
///
/// The chat service enforces a minimum interval between joins on one
/// connection, so new channels are not joined when requested but handed out
/// by [`JoinQueue::drain`], one per worker per tick.
#[derive(Default)]
pub struct JoinQueue {
    pending: Mutex<VecDeque<Channel>>,
}

impl JoinQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `channel`. Returns false when it is already queued.
    pub fn push(&self, channel: Channel) -> bool {
        let mut pending = self.pending.lock();
        if pending.contains(&channel) {
            return false;
        }
        pending.push_back(channel);
        true
    }

    /// Drop `channel` from the queue. Returns true when it was queued.
    pub fn remove(&self, channel: &Channel) -> bool {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|c| c != channel);
        pending.len() != before
    }

    pub fn contains(&self, channel: &Channel) -> bool {
        self.pending.lock().contains(channel)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn pending(&self) -> Vec<Channel> {
        self.pending.lock().iter().cloned().collect()
    }

    /// Pop up to `n` channels from the front.
    pub fn take(&self, n: usize) -> Vec<Channel> {
        let mut pending = self.pending.lock();
        let n = n.min(pending.len());
        pending.drain(..n).collect()
    }

    /// One drain tick: the worker ranked *i* by load joins the *i*-th queued
    /// channel. Returns the channels that were joined and where.
    pub async fn drain(&self, pool: &ConnectionPool) -> Vec<(Channel, usize)> {
        let counts: Vec<usize> = pool.workers().iter().map(|w| w.channel_count()).collect();
        let ranked = rank_workers(&counts);
        let batch = self.take(ranked.len());
        if batch.is_empty() {
            return Vec::new();
        }

        debug!(batch = batch.len(), remaining = self.len(), "draining join queue");

        let joins = batch
            .into_iter()
            .zip(ranked)
            .map(|(channel, worker)| async move {
                let result = pool.assign_to(worker, &channel).await;
                (channel, worker, result)
            });

        let mut joined = Vec::new();
        for (channel, worker, result) in join_all(joins).await {
            match result {
                Ok(Some(owner)) => joined.push((channel, owner)),
                Ok(None) => debug!(%channel, worker, "join cancelled by part"),
                Err(e) => warn!(%channel, worker, error = %e, "failed to join channel"),
            }
        }
        joined
    }
}

/// Worker indices ordered by channel count ascending. Ties keep pool order.
pub fn rank_workers(channel_counts: &[usize]) -> Vec<usize> {
    let mut ranked: Vec<usize> = (0..channel_counts.len()).collect();
    ranked.sort_by_key(|&i| channel_counts[i]);
    ranked
}

/// Wait before the first drain so the channels handed out at startup are
/// joined before queued ones compete for the same join budget.
pub fn initial_drain_delay(initial_channels: usize, join_interval: Duration, connections: usize) -> Duration {
    if connections == 0 {
        return Duration::ZERO;
    }
    let total = join_interval.as_millis() * initial_channels as u128;
    let per_connection = total.div_ceil(connections as u128);
    Duration::from_millis(u64::try_from(per_connection).unwrap_or(u64::MAX))
}
