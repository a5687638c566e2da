use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::try_join_all;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::channel::Channel;
use super::connection::{Connection, Role};
use crate::error::{ConfigError, TransportError};
use crate::transport::{SessionOptions, TransportFactory};

/// One privileged connection plus a fixed set of workers that hold channel
/// subscriptions. A channel is owned by at most one worker.
pub struct ConnectionPool {
    privileged: Connection,
    workers: Vec<Connection>,
    /// Index: channel -> owning worker.
    owners: DashMap<Channel, usize>,
}

/// Split `channels` into `workers` contiguous chunks of at most
/// `ceil(len / workers)` entries, in input order. Trailing chunks may be empty.
pub fn chunk_channels(channels: &[Channel], workers: usize) -> Vec<Vec<Channel>> {
    let mut chunks = vec![Vec::new(); workers];
    if workers == 0 || channels.is_empty() {
        return chunks;
    }
    let chunk_size = channels.len().div_ceil(workers);
    for (slot, chunk) in chunks.iter_mut().zip(channels.chunks(chunk_size)) {
        *slot = chunk.to_vec();
    }
    chunks
}

impl ConnectionPool {
    /// Create the privileged session and `worker_count` worker sessions, handing
    /// each worker its chunk of `initial` channels.
    pub fn build(
        factory: &dyn TransportFactory,
        worker_count: usize,
        initial: &[Channel],
        skip_membership: bool,
    ) -> Result<Self, ConfigError> {
        if worker_count == 0 {
            return Err(ConfigError::NoConnections);
        }

        let privileged = open(factory, Role::Privileged, Vec::new(), skip_membership)?;

        let owners = DashMap::new();
        let mut workers = Vec::with_capacity(worker_count);
        for (index, chunk) in chunk_channels(initial, worker_count).into_iter().enumerate() {
            for channel in &chunk {
                owners.insert(channel.clone(), index);
            }
            workers.push(open(factory, Role::Worker, chunk, skip_membership)?);
        }

        info!(
            workers = worker_count,
            channels = owners.len(),
            "connection pool created"
        );

        Ok(Self {
            privileged,
            workers,
            owners,
        })
    }

    pub fn privileged(&self) -> &Connection {
        &self.privileged
    }

    pub fn workers(&self) -> &[Connection] {
        &self.workers
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// All connections, privileged first, then workers in pool order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        std::iter::once(&self.privileged).chain(self.workers.iter())
    }

    /// Worker that owns `channel`, if any.
    pub fn locate(&self, channel: &Channel) -> Option<usize> {
        self.owners.get(channel).map(|r| *r)
    }

    /// Worker with the fewest channels; ties go to the lowest index.
    pub fn least_loaded(&self) -> usize {
        self.workers
            .iter()
            .enumerate()
            .min_by_key(|(index, w)| (w.channel_count(), *index))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    /// Join `channel` on the least-loaded worker.
    pub async fn assign(&self, channel: &Channel) -> Result<Option<usize>, TransportError> {
        self.assign_to(self.least_loaded(), channel).await
    }

    /// Join `channel` on a specific worker. A channel that is already owned
    /// stays where it is and no second join is issued.
    ///
    /// Returns `None` when the reservation was released by [`unassign`]
    /// while the join was in flight; the channel is parted again and stays
    /// unowned.
    ///
    /// [`unassign`]: ConnectionPool::unassign
    pub async fn assign_to(
        &self,
        worker: usize,
        channel: &Channel,
    ) -> Result<Option<usize>, TransportError> {
        let connection = self.workers.get(worker).ok_or_else(|| TransportError::InvalidArguments {
            op: "join".into(),
            reason: format!("no worker with index {worker}"),
        })?;

        // Reserve ownership before the await so concurrent assigns can't double-join.
        match self.owners.entry(channel.clone()) {
            Entry::Occupied(existing) => return Ok(Some(*existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(worker);
            }
        }

        if let Err(e) = connection.join(channel).await {
            self.owners.remove_if(channel, |_, owner| *owner == worker);
            return Err(e);
        }

        if self.locate(channel) != Some(worker) {
            debug!(%channel, worker, "channel parted while joining, leaving again");
            if let Err(e) = connection.part(channel).await {
                warn!(%channel, worker, error = %e, "failed to leave cancelled channel");
            }
            return Ok(None);
        }

        debug!(%channel, worker, "channel assigned");
        Ok(Some(worker))
    }

    /// Part `channel` on its owner. Returns the former owner, or `None` when the
    /// channel was not assigned.
    pub async fn unassign(&self, channel: &Channel) -> Result<Option<usize>, TransportError> {
        let Some((_, worker)) = self.owners.remove(channel) else {
            return Ok(None);
        };

        if let Err(e) = self.workers[worker].part(channel).await {
            self.owners.insert(channel.clone(), worker);
            return Err(e);
        }

        debug!(%channel, worker, "channel unassigned");
        Ok(Some(worker))
    }

    /// Run `op` on every connection. Fails with the first error.
    pub async fn broadcast(&self, op: &str, args: &[Value]) -> Result<Vec<Value>, TransportError> {
        try_join_all(self.connections().map(|c| c.call(op, args))).await
    }

    pub async fn dispatch_to_privileged(
        &self,
        op: &str,
        args: &[Value],
    ) -> Result<Value, TransportError> {
        self.privileged.call(op, args).await
    }

    /// Run `op` on the worker owning `channel`, or on the privileged connection
    /// when no worker owns it.
    pub async fn dispatch_to_owner(
        &self,
        channel: &Channel,
        op: &str,
        args: &[Value],
    ) -> Result<Value, TransportError> {
        match self.locate(channel) {
            Some(worker) => self.workers[worker].call(op, args).await,
            None => self.privileged.call(op, args).await,
        }
    }

    /// Union of every connection's channels, privileged first.
    pub fn channels(&self) -> Vec<Channel> {
        self.connections().flat_map(|c| c.channels()).collect()
    }
}

fn open(
    factory: &dyn TransportFactory,
    role: Role,
    channels: Vec<Channel>,
    skip_membership: bool,
) -> Result<Connection, ConfigError> {
    let options = SessionOptions {
        role,
        channels: channels.clone(),
        skip_membership,
    };
    let transport = factory
        .create(&options)
        .map_err(|source| ConfigError::Session {
            role: role.as_str(),
            source,
        })?;
    Ok(Connection::new(role, transport, channels))
}
