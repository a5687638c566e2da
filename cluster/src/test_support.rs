//! In-memory transport and snapshot source used by the unit and integration tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::engine::channel::Channel;
use crate::engine::connection::Role;
use crate::engine::events::{EventSink, Listener};
use crate::error::TransportError;
use crate::membership::snapshot::{ChatterSnapshot, SnapshotSource};
use crate::transport::{SessionOptions, Transport, TransportFactory};

pub const FAKE_OPERATIONS: &[&str] = &[
    "connect",
    "disconnect",
    "join",
    "part",
    "ping",
    "ready_state",
    "say",
    "whisper",
    "is_mod",
    "on",
    "once",
    "off",
    "remove_all_listeners",
    "listener_count",
    "emit",
];

/// Records every call; answers with `"<op>:<username>"`.
pub struct FakeTransport {
    pub username: String,
    pub options: SessionOptions,
    pub calls: Mutex<Vec<(String, Vec<Value>)>>,
    pub listeners: Mutex<Vec<String>>,
    pub operations: Vec<String>,
    pub failing: Mutex<HashSet<String>>,
    /// When set, every `join` waits for a permit after being recorded.
    pub join_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeTransport {
    pub fn new(username: &str, options: SessionOptions) -> Self {
        Self {
            username: username.to_string(),
            options,
            calls: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            operations: FAKE_OPERATIONS.iter().map(|s| s.to_string()).collect(),
            failing: Mutex::new(HashSet::new()),
            join_gate: Mutex::new(None),
        }
    }

    pub fn fail(&self, op: &str) {
        self.failing.lock().insert(op.to_string());
    }

    /// Make joins suspend until the returned gate is notified, one permit per join.
    pub fn hold_joins(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.join_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn calls_of(&self, op: &str) -> Vec<Vec<Value>> {
        self.calls
            .lock()
            .iter()
            .filter(|(o, _)| o == op)
            .map(|(_, a)| a.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn operations(&self) -> Vec<String> {
        self.operations.clone()
    }

    async fn call(&self, op: &str, args: &[Value]) -> Result<Value, TransportError> {
        self.calls.lock().push((op.to_string(), args.to_vec()));
        let gate = if op == "join" { self.join_gate.lock().clone() } else { None };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.failing.lock().contains(op) {
            return Err(TransportError::Failed(format!("{op} failed")));
        }
        Ok(Value::String(format!("{op}:{}", self.username)))
    }

    fn on(&self, event: &str, _listener: Listener) {
        self.listeners.lock().push(event.to_string());
    }

    fn username(&self) -> String {
        self.username.clone()
    }
}

/// Hands out [`FakeTransport`]s and keeps them for inspection, privileged first.
#[derive(Default)]
pub struct FakeFactory {
    pub created: Mutex<Vec<Arc<FakeTransport>>>,
    pub extra_operation: Option<String>,
}

impl FakeFactory {
    pub fn with_extra_operation(op: &str) -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            extra_operation: Some(op.to_string()),
        }
    }

    pub fn session(&self, index: usize) -> Arc<FakeTransport> {
        self.created.lock()[index].clone()
    }
}

impl TransportFactory for FakeFactory {
    fn create(&self, options: &SessionOptions) -> Result<Arc<dyn Transport>, TransportError> {
        let mut created = self.created.lock();
        let username = match options.role {
            Role::Privileged => "botuser".to_string(),
            Role::Worker => format!("justinfan{}", created.len()),
        };
        let mut transport = FakeTransport::new(&username, options.clone());
        if let Some(op) = &self.extra_operation {
            transport.operations.push(op.clone());
        }
        let transport = Arc::new(transport);
        created.push(transport.clone());
        Ok(transport)
    }
}

/// Serves queued snapshots per channel; errors when a channel's queue is empty.
#[derive(Default)]
pub struct ScriptedSource {
    pub responses: Mutex<HashMap<String, VecDeque<ChatterSnapshot>>>,
    pub fetched: Mutex<Vec<Channel>>,
}

impl ScriptedSource {
    pub fn push(&self, channel: &str, snapshot: ChatterSnapshot) {
        self.responses
            .lock()
            .entry(Channel::parse(channel).unwrap().to_string())
            .or_default()
            .push_back(snapshot);
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch(&self, channel: &Channel) -> anyhow::Result<ChatterSnapshot> {
        self.fetched.lock().push(channel.clone());
        self.responses
            .lock()
            .get_mut(channel.as_str())
            .and_then(|q| q.pop_front())
            .ok_or_else(|| anyhow::anyhow!("no chatters for {channel}"))
    }
}

/// Event sink that keeps everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<(String, Vec<Value>)>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<(String, Vec<Value>)> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &str, args: &[Value]) {
        self.events.lock().push((event.to_string(), args.to_vec()));
    }
}

pub fn snapshot(categories: &[(&str, &[&str])]) -> ChatterSnapshot {
    ChatterSnapshot::from_categories(
        categories
            .iter()
            .map(|(c, names)| (c.to_string(), names.iter().map(|n| n.to_string()).collect())),
    )
}

pub fn channels(names: &[&str]) -> Vec<Channel> {
    names.iter().map(|n| Channel::parse(n).unwrap()).collect()
}
