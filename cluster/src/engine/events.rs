use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::channel::Channel;

/// Callback attached to a named event. Receives the event's positional arguments.
pub type Listener = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Event name emitted when a user shows up in a channel's chatter list.
pub const JOIN_EVENT: &str = "join";

/// Event name emitted when a user drops out of a channel's chatter list.
pub const PART_EVENT: &str = "part";

/// Receives events by name. Injected into the cluster and the membership watcher.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, args: &[Value]);
}

/// Listener registration by event name. Injected into the cluster next to
/// the [`EventSink`] so membership listeners can live on any event hub.
pub trait EventRegistry: Send + Sync {
    fn on(&self, event: &str, listener: Listener);

    /// Register a listener that is dropped after its first invocation.
    fn once(&self, event: &str, listener: Listener);

    fn off(&self, event: &str, listener: &Listener);

    /// Remove every listener for `event`, or for all events when `None`.
    fn remove_all_listeners(&self, event: Option<&str>);

    fn listener_count(&self, event: &str) -> usize;
}

/// A membership change reconstructed from two consecutive chatter snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub kind: MembershipKind,
    pub channel: Channel,
    pub username: String,
    /// True when the username is the cluster's own identity.
    pub is_self: bool,
    /// Chatter category the change happened in (viewers, moderators, ...).
    pub category: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipKind {
    Join,
    Part,
}

impl MembershipKind {
    pub fn event_name(self) -> &'static str {
        match self {
            MembershipKind::Join => JOIN_EVENT,
            MembershipKind::Part => PART_EVENT,
        }
    }
}

impl MembershipEvent {
    /// Positional payload: `(channel, username, is_self, category)`.
    pub fn to_args(&self) -> Vec<Value> {
        vec![
            Value::String(self.channel.to_string()),
            Value::String(self.username.clone()),
            Value::Bool(self.is_self),
            Value::String(self.category.clone()),
        ]
    }

    pub fn emit_to(&self, sink: &dyn EventSink) {
        sink.emit(self.kind.event_name(), &self.to_args());
    }
}

/// Listener registry keyed by event name.
#[derive(Default)]
pub struct EventBus {
    listeners: DashMap<String, Vec<Registration>>,
}

struct Registration {
    listener: Listener,
    once: bool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: &str, listener: Listener) {
        self.register(event, listener, false);
    }

    /// Register a listener that is dropped after its first invocation.
    pub fn once(&self, event: &str, listener: Listener) {
        self.register(event, listener, true);
    }

    /// Remove a specific listener (compared by pointer).
    pub fn off(&self, event: &str, listener: &Listener) {
        if let Some(mut regs) = self.listeners.get_mut(event) {
            regs.retain(|r| !Arc::ptr_eq(&r.listener, listener));
        }
    }

    /// Remove every listener for `event`, or for all events when `None`.
    pub fn remove_all_listeners(&self, event: Option<&str>) {
        match event {
            Some(event) => {
                self.listeners.remove(event);
            }
            None => self.listeners.clear(),
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map(|r| r.len()).unwrap_or(0)
    }

    fn register(&self, event: &str, listener: Listener, once: bool) {
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(Registration { listener, once });
    }
}

impl EventRegistry for EventBus {
    fn on(&self, event: &str, listener: Listener) {
        EventBus::on(self, event, listener);
    }

    fn once(&self, event: &str, listener: Listener) {
        EventBus::once(self, event, listener);
    }

    fn off(&self, event: &str, listener: &Listener) {
        EventBus::off(self, event, listener);
    }

    fn remove_all_listeners(&self, event: Option<&str>) {
        EventBus::remove_all_listeners(self, event);
    }

    fn listener_count(&self, event: &str) -> usize {
        EventBus::listener_count(self, event)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &str, args: &[Value]) {
        // Snapshot the listeners and drop the map guard before calling out, so a
        // listener may register or remove listeners itself.
        let listeners: Vec<Listener> = match self.listeners.get_mut(event) {
            Some(mut regs) => {
                let current = regs.iter().map(|r| r.listener.clone()).collect();
                regs.retain(|r| !r.once);
                current
            }
            None => return,
        };

        for listener in listeners {
            listener(args);
        }
    }
}
