use std::collections::HashMap;

use serde_json::Value;

use super::channel::Channel;
use super::events::{JOIN_EVENT, PART_EVENT};
use crate::error::{ConfigError, DispatchError};
use crate::transport::REQUIRED_OPERATIONS;

/// Where an operation issued against the cluster runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchClass {
    /// Every connection; results merged.
    Broadcast,
    /// The worker owning the channel in the first argument, else the privileged connection.
    PerChannel,
    /// The privileged connection only.
    Privileged,
}

/// Resolved target for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    All,
    Owner(Channel),
    Privileged,
    /// Membership listener operations handled by the watcher in emulation mode.
    Watcher,
}

/// Operations the cluster implements itself instead of forwarding.
pub const CLUSTER_OPERATIONS: &[&str] = &["join", "part", "get_channels", "chatters"];

/// Dispatch class of every transport operation the cluster knows how to route.
pub const OPERATION_TABLE: &[(&str, DispatchClass)] = &[
    // Session lifecycle runs everywhere.
    ("connect", DispatchClass::Broadcast),
    ("disconnect", DispatchClass::Broadcast),
    ("ping", DispatchClass::Broadcast),
    ("ready_state", DispatchClass::Broadcast),
    // Event-emitter capability, per connection.
    ("on", DispatchClass::Broadcast),
    ("once", DispatchClass::Broadcast),
    ("off", DispatchClass::Broadcast),
    ("remove_all_listeners", DispatchClass::Broadcast),
    ("listener_count", DispatchClass::Broadcast),
    ("set_max_listeners", DispatchClass::Broadcast),
    ("emit", DispatchClass::Broadcast),
    // Channel-scoped queries answered by whoever sits in the channel.
    ("is_mod", DispatchClass::PerChannel),
    // Only the logged-in identity may speak or moderate.
    ("say", DispatchClass::Privileged),
    ("action", DispatchClass::Privileged),
    ("whisper", DispatchClass::Privileged),
    ("raw", DispatchClass::Privileged),
    ("ban", DispatchClass::Privileged),
    ("unban", DispatchClass::Privileged),
    ("timeout", DispatchClass::Privileged),
    ("clear", DispatchClass::Privileged),
    ("delete_message", DispatchClass::Privileged),
    ("color", DispatchClass::Privileged),
    ("commercial", DispatchClass::Privileged),
    ("host", DispatchClass::Privileged),
    ("unhost", DispatchClass::Privileged),
    ("raid", DispatchClass::Privileged),
    ("unraid", DispatchClass::Privileged),
    ("mod", DispatchClass::Privileged),
    ("unmod", DispatchClass::Privileged),
    ("mods", DispatchClass::Privileged),
    ("vip", DispatchClass::Privileged),
    ("unvip", DispatchClass::Privileged),
    ("vips", DispatchClass::Privileged),
    ("slow", DispatchClass::Privileged),
    ("slow_off", DispatchClass::Privileged),
    ("followers_only", DispatchClass::Privileged),
    ("followers_only_off", DispatchClass::Privileged),
    ("subscribers", DispatchClass::Privileged),
    ("subscribers_off", DispatchClass::Privileged),
    ("emote_only", DispatchClass::Privileged),
    ("emote_only_off", DispatchClass::Privileged),
    ("r9k_beta", DispatchClass::Privileged),
    ("r9k_beta_off", DispatchClass::Privileged),
    ("get_username", DispatchClass::Privileged),
    ("get_options", DispatchClass::Privileged),
];

/// The routing table for one cluster, restricted to operations its transports provide.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    classes: HashMap<String, DispatchClass>,
}

impl DispatchTable {
    /// Classify every advertised operation. `advertised` holds one operation
    /// list per session. Fails on an operation the table does not know, or a
    /// session lacking a required operation.
    pub fn build<I>(advertised: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let mut classes = HashMap::new();

        for ops in advertised {
            for required in REQUIRED_OPERATIONS {
                if !ops.iter().any(|op| op == required) {
                    return Err(ConfigError::MissingOperation(required));
                }
            }

            for op in ops {
                if CLUSTER_OPERATIONS.contains(&op.as_str()) {
                    continue;
                }
                let class = lookup(&op).ok_or_else(|| ConfigError::UnclassifiedOperation(op.clone()))?;
                classes.insert(op, class);
            }
        }

        Ok(Self { classes })
    }

    pub fn class_of(&self, op: &str) -> Option<DispatchClass> {
        self.classes.get(op).copied()
    }

    /// Resolve where `op(args)` runs.
    pub fn route(&self, op: &str, args: &[Value], emulation: bool) -> Result<Route, DispatchError> {
        let class = self
            .class_of(op)
            .ok_or_else(|| DispatchError::UnknownOperation(op.to_string()))?;

        Ok(match class {
            DispatchClass::Broadcast if emulation && is_membership_event(args.first()) => {
                Route::Watcher
            }
            DispatchClass::Broadcast => Route::All,
            DispatchClass::PerChannel => {
                let name = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| DispatchError::MissingChannel(op.to_string()))?;
                match Channel::parse(name) {
                    Ok(channel) => Route::Owner(channel),
                    Err(_) => Route::Privileged,
                }
            }
            DispatchClass::Privileged => Route::Privileged,
        })
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

fn lookup(op: &str) -> Option<DispatchClass> {
    OPERATION_TABLE
        .iter()
        .find(|(name, _)| *name == op)
        .map(|(_, class)| *class)
}

fn is_membership_event(first: Option<&Value>) -> bool {
    matches!(first.and_then(Value::as_str), Some(JOIN_EVENT | PART_EVENT))
}
