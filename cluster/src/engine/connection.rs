use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use super::channel::Channel;
use crate::error::TransportError;
use crate::transport::Transport;

/// What a connection is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The authenticated session. Sends messages and runs owner-only operations.
    Privileged,
    /// An anonymous session that only holds channel subscriptions.
    Worker,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Privileged => "privileged",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pooled session plus the channels joined through it.
pub struct Connection {
    pub role: Role,
    transport: Arc<dyn Transport>,
    /// Joined channels in join order.
    channels: Mutex<Vec<Channel>>,
    pub created_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(role: Role, transport: Arc<dyn Transport>, channels: Vec<Channel>) -> Self {
        Self {
            role,
            transport,
            channels: Mutex::new(channels),
            created_at: Utc::now(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels.lock().clone()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.lock().contains(channel)
    }

    pub async fn call(&self, op: &str, args: &[Value]) -> Result<Value, TransportError> {
        self.transport.call(op, args).await
    }

    pub async fn connect(&self) -> Result<Value, TransportError> {
        self.call("connect", &[]).await
    }

    pub async fn disconnect(&self) -> Result<Value, TransportError> {
        self.call("disconnect", &[]).await
    }

    pub async fn ping(&self) -> Result<Value, TransportError> {
        self.call("ping", &[]).await
    }

    pub async fn ready_state(&self) -> Result<Value, TransportError> {
        self.call("ready_state", &[]).await
    }

    /// Join on the wire, then record the channel.
    pub async fn join(&self, channel: &Channel) -> Result<Value, TransportError> {
        let result = self
            .transport
            .call("join", &[Value::String(channel.to_string())])
            .await?;
        let mut channels = self.channels.lock();
        if !channels.contains(channel) {
            channels.push(channel.clone());
        }
        Ok(result)
    }

    /// Part on the wire, then forget the channel.
    pub async fn part(&self, channel: &Channel) -> Result<Value, TransportError> {
        let result = self
            .transport
            .call("part", &[Value::String(channel.to_string())])
            .await?;
        self.channels.lock().retain(|c| c != channel);
        Ok(result)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("channels", &*self.channels.lock())
            .field("created_at", &self.created_at)
            .finish()
    }
}
