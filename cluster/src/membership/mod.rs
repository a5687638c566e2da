//! Membership emulation: join/part events rebuilt from polled chatter lists.

pub mod diff;
pub mod snapshot;
pub mod watcher;
