//! Spread chat channel subscriptions over a small pool of connections while
//! presenting them as one client.
//!
//! A [`Cluster`] owns one privileged session and a fixed number of anonymous
//! worker sessions built by a [`TransportFactory`]. Startup channels are split
//! evenly across the workers; later joins are queued and handed to the least
//! loaded workers at the transport's join rate. Operations are routed by name
//! to one, the owning, or all sessions.
//!
//! With `mock_membership` enabled the cluster also polls each channel's
//! chatter list and emits `join`/`part` events from the differences.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod membership;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::ClusterConfig;
pub use engine::channel::Channel;
pub use engine::cluster::Cluster;
pub use engine::events::{EventBus, EventRegistry, EventSink, Listener, MembershipEvent};
pub use error::{ClusterError, ConfigError, DispatchError, TransportError};
pub use membership::snapshot::{ChatterSnapshot, HttpSnapshotSource, SnapshotSource};
pub use transport::{SessionOptions, Transport, TransportFactory};
