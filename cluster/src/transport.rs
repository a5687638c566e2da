//! The chat transport seam.
//!
//! The cluster never speaks the chat protocol itself. Each connection in the
//! pool is backed by a [`Transport`] session built by a [`TransportFactory`];
//! everything the cluster does to a session goes through [`Transport::call`]
//! with an operation name and JSON arguments.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::engine::channel::Channel;
use crate::engine::connection::Role;
use crate::engine::events::Listener;
use crate::error::TransportError;

/// Operation names every transport must provide.
pub const REQUIRED_OPERATIONS: &[&str] = &["connect", "disconnect", "join", "part", "ping"];

/// How a single session should be created.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub role: Role,
    /// Channels the session joins by itself once connected.
    pub channels: Vec<Channel>,
    /// Ask the transport not to emit its own join/part membership events.
    pub skip_membership: bool,
}

/// One session with the chat service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Names of every operation accepted by [`Transport::call`].
    fn operations(&self) -> Vec<String>;

    /// Run a named operation.
    async fn call(&self, op: &str, args: &[Value]) -> Result<Value, TransportError>;

    /// Attach a listener for an event emitted by this session.
    fn on(&self, event: &str, listener: Listener);

    /// Identity this session is logged in as.
    fn username(&self) -> String;
}

/// Builds sessions for the pool. Called once per connection at cluster construction.
pub trait TransportFactory: Send + Sync {
    fn create(&self, options: &SessionOptions) -> Result<Arc<dyn Transport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&SessionOptions) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync,
{
    fn create(&self, options: &SessionOptions) -> Result<Arc<dyn Transport>, TransportError> {
        self(options)
    }
}
