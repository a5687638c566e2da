//! Connection pool, dispatch and join scheduling.

pub mod channel;
pub mod cluster;
pub mod connection;
pub mod dispatch;
pub mod events;
pub mod join_queue;
pub mod pool;
