use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::channel::Channel;
use super::dispatch::{DispatchTable, Route};
use super::events::{EventBus, EventRegistry, EventSink, Listener};
use super::join_queue::{JoinQueue, initial_drain_delay};
use super::pool::ConnectionPool;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, ConfigError, DispatchError, TransportError};
use crate::membership::snapshot::{ChatterSnapshot, HttpSnapshotSource, SnapshotSource};
use crate::membership::watcher::MembershipWatcher;
use crate::transport::TransportFactory;

/// A pool of chat connections that behaves like one client.
///
/// Channel subscriptions are spread over anonymous worker connections while a
/// single privileged connection speaks for the cluster. Every operation is
/// routed by its [`DispatchTable`] class; joins go through a rate-limited
/// queue. With `mock_membership` enabled, a [`MembershipWatcher`] rebuilds
/// join/part events from polled chatter lists.
pub struct Cluster {
    pool: Arc<ConnectionPool>,
    dispatch: DispatchTable,
    queue: Arc<JoinQueue>,
    watcher: Option<Arc<MembershipWatcher>>,
    /// Receives membership events emitted by the watcher.
    sink: Arc<dyn EventSink>,
    /// Where membership listeners are registered.
    registry: Arc<dyn EventRegistry>,
    config: ClusterConfig,
    /// Channels handed out at startup; delays the first queue drain.
    initial_channels: usize,
    drain_task: Mutex<Option<CancellationToken>>,
}

impl Cluster {
    /// Build a cluster that polls the configured chatters endpoint over HTTP
    /// and keeps membership listeners on its own [`EventBus`].
    pub fn new(config: ClusterConfig, factory: &dyn TransportFactory) -> Result<Self, ConfigError> {
        let bus = Arc::new(EventBus::new());
        Self::with_parts(config, factory, None, bus.clone(), bus)
    }

    /// Build a cluster with an explicit chatters source and event hub.
    /// `source` is only used when `mock_membership` is enabled; `None` means HTTP.
    /// Membership events go to `sink`; listeners for them register on `registry`.
    pub fn with_parts(
        config: ClusterConfig,
        factory: &dyn TransportFactory,
        source: Option<Arc<dyn SnapshotSource>>,
        sink: Arc<dyn EventSink>,
        registry: Arc<dyn EventRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let channels = config.initial_channels()?;
        let emulate = config.cluster.mock_membership;

        let pool = ConnectionPool::build(factory, config.cluster.connections, &channels, emulate)?;
        let dispatch = DispatchTable::build(pool.connections().map(|c| c.transport().operations()))?;

        let watcher = if emulate {
            let source: Arc<dyn SnapshotSource> = match source {
                Some(source) => source,
                None => Arc::new(
                    HttpSnapshotSource::new(config.cluster.chatters_url.clone())
                        .map_err(|e| ConfigError::SnapshotSource(e.to_string()))?,
                ),
            };
            Some(Arc::new(MembershipWatcher::new(
                channels.clone(),
                &pool.privileged().transport().username(),
                source,
                sink.clone(),
                config.poll_timing(),
            )))
        } else {
            None
        };

        info!(
            connections = pool.worker_count(),
            channels = channels.len(),
            operations = dispatch.len(),
            mock_membership = emulate,
            "cluster created"
        );

        Ok(Self {
            pool: Arc::new(pool),
            dispatch,
            queue: Arc::new(JoinQueue::new()),
            watcher,
            sink,
            registry,
            config,
            initial_channels: channels.len(),
            drain_task: Mutex::new(None),
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Connect every session, start the join queue and, in emulation mode, the
    /// chatters poller. Returns one result per connection, privileged first.
    pub async fn connect(&self) -> Result<Vec<Value>, ClusterError> {
        if let Some(watcher) = &self.watcher {
            watcher.connect();
        }
        self.start_join_drain();
        info!(connections = self.pool.worker_count() + 1, "cluster connecting");
        Ok(self.pool.broadcast("connect", &[]).await?)
    }

    /// Stop the background tasks and disconnect every session.
    pub async fn disconnect(&self) -> Result<Vec<Value>, ClusterError> {
        self.stop_background_tasks();
        info!("cluster disconnecting");
        Ok(self.pool.broadcast("disconnect", &[]).await?)
    }

    pub async fn ping_all(&self) -> Result<Vec<Value>, ClusterError> {
        Ok(self.pool.broadcast("ping", &[]).await?)
    }

    pub async fn ready_state_all(&self) -> Result<Vec<Value>, ClusterError> {
        Ok(self.pool.broadcast("ready_state", &[]).await?)
    }

    fn start_join_drain(&self) {
        let mut task = self.drain_task.lock();
        if task.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *task = Some(token.clone());

        let pool = self.pool.clone();
        let queue = self.queue.clone();
        let watcher = self.watcher.clone();
        let interval = self.config.join_interval();
        let mut wait = initial_drain_delay(self.initial_channels, interval, pool.worker_count());

        tokio::spawn(async move {
            debug!(first_drain_ms = wait.as_millis() as u64, "join queue scheduler started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                drain_tick(&pool, &queue, watcher.as_deref()).await;
                wait = interval;
            }
            debug!("join queue scheduler stopped");
        });
    }

    fn stop_background_tasks(&self) {
        if let Some(watcher) = &self.watcher {
            watcher.disconnect();
        }
        if let Some(token) = self.drain_task.lock().take() {
            token.cancel();
        }
    }

    // ── Channels ────────────────────────────────────────────────────

    /// Queue `channel` for joining. Nothing goes over the wire until the next
    /// drain tick. Already joined or already queued channels are ignored.
    pub fn join(&self, channel: &str) -> Result<(), ClusterError> {
        let channel = parse_channel(channel)?;
        if let Some(worker) = self.pool.locate(&channel) {
            debug!(%channel, worker, "join ignored, channel already assigned");
            return Ok(());
        }
        if self.queue.push(channel.clone()) {
            debug!(%channel, pending = self.queue.len(), "join queued");
        }
        Ok(())
    }

    /// Leave `channel` right away. A channel still waiting in the join queue is
    /// dropped from it; an unknown channel is ignored.
    pub async fn part(&self, channel: &str) -> Result<(), ClusterError> {
        let channel = parse_channel(channel)?;

        if self.queue.remove(&channel) {
            debug!(%channel, "queued join cancelled by part");
        }
        if let Some(worker) = self.pool.unassign(&channel).await? {
            info!(%channel, worker, "channel parted");
        }
        if let Some(watcher) = &self.watcher {
            watcher.part(&channel);
        }
        Ok(())
    }

    /// Every joined channel, privileged connection first, then workers in order.
    pub fn channels(&self) -> Vec<Channel> {
        self.pool.channels()
    }

    /// Channels waiting in the join queue, oldest first.
    pub fn pending_joins(&self) -> Vec<Channel> {
        self.queue.pending()
    }

    /// Run one join queue drain immediately.
    pub async fn drain_join_queue(&self) -> Vec<(Channel, usize)> {
        drain_tick(&self.pool, &self.queue, self.watcher.as_deref()).await
    }

    /// Last chatter snapshot of `channel`. Only available with `mock_membership`.
    pub fn chatters(&self, channel: &str) -> Result<Option<ChatterSnapshot>, ClusterError> {
        let watcher = self.watcher.as_ref().ok_or(DispatchError::EmulationDisabled)?;
        let channel = parse_channel(channel)?;
        Ok(watcher.chatters(&channel))
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Register a listener on every connection, or on the cluster's membership
    /// events for `join`/`part` in emulation mode.
    pub fn on(&self, event: &str, listener: Listener) -> Result<(), ClusterError> {
        let args = [Value::String(event.to_string())];
        match self.dispatch.route("on", &args, self.watcher.is_some())? {
            Route::Watcher => self.registry.on(event, listener),
            _ => {
                for connection in self.pool.connections() {
                    connection.transport().on(event, listener.clone());
                }
            }
        }
        Ok(())
    }

    /// Run any transport operation by name against the right connection(s).
    /// Broadcast operations return an array with one entry per connection.
    pub async fn invoke(&self, op: &str, args: &[Value]) -> Result<Value, ClusterError> {
        match op {
            "connect" => return Ok(Value::Array(self.connect().await?)),
            "disconnect" => return Ok(Value::Array(self.disconnect().await?)),
            "join" => {
                self.join(str_arg(op, args)?)?;
                return Ok(Value::Null);
            }
            "part" => {
                self.part(str_arg(op, args)?).await?;
                return Ok(Value::Null);
            }
            "get_channels" => {
                let channels = self
                    .channels()
                    .into_iter()
                    .map(|c| Value::String(c.into()))
                    .collect();
                return Ok(Value::Array(channels));
            }
            "chatters" => {
                let snapshot = self.chatters(str_arg(op, args)?)?;
                return Ok(serde_json::to_value(snapshot)?);
            }
            _ => {}
        }

        let route = self.dispatch.route(op, args, self.watcher.is_some())?;
        debug!(op, ?route, "dispatching");
        let result = match route {
            Route::All => Value::Array(self.pool.broadcast(op, args).await?),
            Route::Owner(channel) => self.pool.dispatch_to_owner(&channel, op, args).await?,
            Route::Privileged => self.pool.dispatch_to_privileged(op, args).await?,
            Route::Watcher => self.membership_listener_op(op, args)?,
        };
        Ok(result)
    }

    /// Event-emitter operations aimed at `join`/`part` while emulating membership.
    fn membership_listener_op(&self, op: &str, args: &[Value]) -> Result<Value, ClusterError> {
        let event = str_arg(op, args)?;
        match op {
            "remove_all_listeners" => {
                self.registry.remove_all_listeners(Some(event));
                Ok(Value::Null)
            }
            "listener_count" => Ok(Value::from(self.registry.listener_count(event))),
            "emit" => {
                self.sink.emit(event, &args[1..]);
                Ok(Value::Bool(true))
            }
            "set_max_listeners" => Ok(Value::Null),
            _ => Err(TransportError::Unsupported(format!(
                "{op} with a callback; use Cluster::on to register membership listeners"
            ))
            .into()),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn events(&self) -> &Arc<dyn EventRegistry> {
        &self.registry
    }

    pub fn watcher(&self) -> Option<&Arc<MembershipWatcher>> {
        self.watcher.as_ref()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop_background_tasks();
    }
}

async fn drain_tick(
    pool: &ConnectionPool,
    queue: &JoinQueue,
    watcher: Option<&MembershipWatcher>,
) -> Vec<(Channel, usize)> {
    let joined = queue.drain(pool).await;
    for (channel, worker) in &joined {
        info!(%channel, worker, "channel joined");
        if let Some(watcher) = watcher {
            watcher.join(channel.clone());
        }
    }
    joined
}

fn parse_channel(name: &str) -> Result<Channel, DispatchError> {
    Channel::parse(name).map_err(|reason| DispatchError::InvalidChannel {
        name: name.to_string(),
        reason,
    })
}

fn str_arg<'a>(op: &str, args: &'a [Value]) -> Result<&'a str, DispatchError> {
    args.first()
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::MissingChannel(op.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeFactory, RecordingSink, ScriptedSource, snapshot};

    fn config(connections: usize, channels: &[&str], mock: bool) -> ClusterConfig {
        let mut config = ClusterConfig::default();
        config.cluster.connections = connections;
        config.cluster.mock_membership = mock;
        config.channels = channels.iter().map(|s| s.to_string()).collect();
        config
    }

    fn build_cluster(connections: usize, channels: &[&str], mock: bool) -> (Cluster, FakeFactory) {
        let factory = FakeFactory::default();
        let source: Arc<dyn SnapshotSource> = Arc::new(ScriptedSource::default());
        let bus = Arc::new(EventBus::new());
        let cluster = Cluster::with_parts(
            config(connections, channels, mock),
            &factory,
            Some(source),
            bus.clone(),
            bus,
        )
        .unwrap();
        (cluster, factory)
    }

    #[test]
    fn test_unclassified_transport_operation_fails_construction() {
        let factory = FakeFactory::with_extra_operation("teleport");
        let result = Cluster::new(config(2, &[], false), &factory);
        assert!(matches!(result, Err(ConfigError::UnclassifiedOperation(op)) if op == "teleport"));
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let factory = FakeFactory::default();
        assert!(matches!(
            Cluster::new(config(0, &[], false), &factory),
            Err(ConfigError::NoConnections)
        ));
        assert!(factory.created.lock().is_empty());
    }

    #[test]
    fn test_emulation_marks_sessions() {
        let (_cluster, factory) = build_cluster(2, &["a"], true);
        assert!(factory.created.lock().iter().all(|t| t.options.skip_membership));

        let (_cluster, factory) = build_cluster(2, &["a"], false);
        assert!(factory.created.lock().iter().all(|t| !t.options.skip_membership));
    }

    #[test]
    fn test_join_only_queues() {
        let (cluster, factory) = build_cluster(2, &["a"], false);
        cluster.join("B").unwrap();
        cluster.join("#b").unwrap();
        cluster.join("a").unwrap(); // already assigned at startup

        assert_eq!(cluster.pending_joins(), vec![Channel::parse("b").unwrap()]);
        assert!(factory.created.lock().iter().all(|t| t.calls_of("join").is_empty()));
        assert!(matches!(
            cluster.join("bad name"),
            Err(ClusterError::Dispatch(DispatchError::InvalidChannel { .. }))
        ));
    }

    #[tokio::test]
    async fn test_part_of_queued_channel_cancels_join() {
        let (cluster, factory) = build_cluster(2, &[], false);
        cluster.join("later").unwrap();
        cluster.part("later").await.unwrap();

        assert!(cluster.pending_joins().is_empty());
        assert!(cluster.drain_join_queue().await.is_empty());
        assert!(factory.created.lock().iter().all(|t| t.calls_of("part").is_empty()));
    }

    #[tokio::test]
    async fn test_part_of_unknown_channel_is_silent() {
        let (cluster, _) = build_cluster(2, &["a"], false);
        cluster.part("never").await.unwrap();
        assert_eq!(cluster.channels(), vec![Channel::parse("a").unwrap()]);
    }

    #[tokio::test]
    async fn test_chatters_requires_emulation() {
        let (cluster, _) = build_cluster(2, &["a"], false);
        assert!(matches!(
            cluster.chatters("a"),
            Err(ClusterError::Dispatch(DispatchError::EmulationDisabled))
        ));

        let (cluster, _) = build_cluster(2, &["a"], true);
        assert_eq!(cluster.chatters("a").unwrap(), None);
    }

    #[tokio::test]
    async fn test_invoke_routes_by_class() {
        let (cluster, factory) = build_cluster(2, &["a", "b"], false);

        let pong = cluster.invoke("ping", &[]).await.unwrap();
        assert_eq!(pong.as_array().map(Vec::len), Some(3));

        let said = cluster
            .invoke("say", &[Value::from("#b"), Value::from("hello")])
            .await
            .unwrap();
        assert_eq!(said, Value::from("say:botuser"));

        let owner = cluster
            .invoke("is_mod", &[Value::from("B"), Value::from("someone")])
            .await
            .unwrap();
        assert_eq!(owner, Value::from("is_mod:justinfan2"));

        let fallback = cluster
            .invoke("is_mod", &[Value::from("elsewhere"), Value::from("someone")])
            .await
            .unwrap();
        assert_eq!(fallback, Value::from("is_mod:botuser"));

        assert!(matches!(
            cluster.invoke("ban", &[]).await,
            Err(ClusterError::Dispatch(DispatchError::UnknownOperation(_)))
        ));
        assert_eq!(factory.session(2).calls_of("say").len(), 0);
    }

    #[tokio::test]
    async fn test_invoke_passes_transport_errors_through() {
        let (cluster, factory) = build_cluster(1, &[], false);
        factory.session(0).fail("say");
        let err = cluster
            .invoke("say", &[Value::from("#a"), Value::from("hi")])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "say failed");
    }

    #[tokio::test]
    async fn test_invoke_cluster_owned_operations() {
        let (cluster, _) = build_cluster(2, &["a", "b"], false);
        assert_eq!(
            cluster.invoke("get_channels", &[]).await.unwrap(),
            serde_json::json!(["#a", "#b"])
        );
        cluster.invoke("join", &[Value::from("c")]).await.unwrap();
        assert_eq!(cluster.pending_joins(), vec![Channel::parse("c").unwrap()]);
        assert!(matches!(
            cluster.invoke("part", &[]).await,
            Err(ClusterError::Dispatch(DispatchError::MissingChannel(_)))
        ));
    }

    #[test]
    fn test_membership_listeners_redirect_in_emulation() {
        let (cluster, factory) = build_cluster(2, &[], true);
        let listener: Listener = Arc::new(|_: &[Value]| {});

        cluster.on("join", listener.clone()).unwrap();
        cluster.on("message", listener).unwrap();

        assert_eq!(cluster.events().listener_count("join"), 1);
        for transport in factory.created.lock().iter() {
            assert_eq!(*transport.listeners.lock(), vec!["message".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_membership_listener_ops_via_invoke() {
        let (cluster, factory) = build_cluster(1, &[], true);
        cluster.on("part", Arc::new(|_: &[Value]| {})).unwrap();

        let count = cluster.invoke("listener_count", &[Value::from("part")]).await.unwrap();
        assert_eq!(count, Value::from(1));
        cluster
            .invoke("remove_all_listeners", &[Value::from("part")])
            .await
            .unwrap();
        assert_eq!(cluster.events().listener_count("part"), 0);
        assert!(factory.session(0).calls_of("remove_all_listeners").is_empty());

        // Without emulation the same call reaches every connection.
        let (cluster, factory) = build_cluster(1, &[], false);
        cluster
            .invoke("remove_all_listeners", &[Value::from("part")])
            .await
            .unwrap();
        assert_eq!(factory.session(1).calls_of("remove_all_listeners").len(), 1);
    }

    #[tokio::test]
    async fn test_emit_and_callback_ops_in_emulation() {
        let (cluster, factory) = build_cluster(1, &[], true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        cluster
            .on("join", Arc::new(move |args: &[Value]| s.lock().push(args.to_vec())))
            .unwrap();

        let emitted = cluster
            .invoke("emit", &[Value::from("join"), Value::from("#a"), Value::from("bob")])
            .await
            .unwrap();
        assert_eq!(emitted, Value::Bool(true));
        assert_eq!(*seen.lock(), vec![vec![Value::from("#a"), Value::from("bob")]]);

        for op in ["once", "off"] {
            assert!(matches!(
                cluster.invoke(op, &[Value::from("join")]).await,
                Err(ClusterError::Transport(TransportError::Unsupported(_)))
            ));
        }
        assert!(factory.created.lock().iter().all(|t| t.calls.lock().is_empty()));
    }

    #[tokio::test]
    async fn test_membership_events_go_to_injected_sink() {
        let factory = FakeFactory::default();
        let source = Arc::new(ScriptedSource::default());
        source.push("a", snapshot(&[("viewers", &["bob"])]));
        source.push("a", snapshot(&[("viewers", &["bob", "carol"])]));
        let sink = Arc::new(RecordingSink::default());
        let registry = Arc::new(EventBus::new());

        let source_dyn: Arc<dyn SnapshotSource> = source;
        let cluster = Cluster::with_parts(
            config(1, &["a"], true),
            &factory,
            Some(source_dyn),
            sink.clone(),
            registry.clone(),
        )
        .unwrap();
        cluster.on("join", Arc::new(|_: &[Value]| {})).unwrap();
        assert_eq!(registry.listener_count("join"), 1);

        let watcher = cluster.watcher().unwrap();
        watcher.poll_once().await;
        watcher.poll_once().await;

        let events = sink.take();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "join");
        assert_eq!(events[0].1[1], Value::from("carol"));
    }

    #[tokio::test]
    async fn test_part_during_drain_keeps_channel_out() {
        let (cluster, factory) = build_cluster(1, &[], true);
        let gate = factory.session(1).hold_joins();
        let x = Channel::parse("x").unwrap();
        cluster.join("x").unwrap();

        let (joined, parted) = tokio::join!(cluster.drain_join_queue(), async {
            tokio::task::yield_now().await;
            let parted = cluster.part("x").await;
            gate.notify_one();
            parted
        });

        parted.unwrap();
        assert!(joined.is_empty());
        assert_eq!(cluster.pool().locate(&x), None);
        assert!(cluster.channels().is_empty());
        assert!(!cluster.watcher().unwrap().channels().contains(&x));

        // Joining again goes through the queue as usual.
        cluster.join("x").unwrap();
        assert_eq!(cluster.pending_joins(), vec![x]);
    }

    #[tokio::test]
    async fn test_chatters_via_invoke() {
        let (cluster, _) = build_cluster(1, &["a"], true);
        assert_eq!(cluster.invoke("chatters", &[Value::from("a")]).await.unwrap(), Value::Null);

        let (cluster, _) = build_cluster(1, &["a"], false);
        assert!(matches!(
            cluster.invoke("chatters", &[Value::from("a")]).await,
            Err(ClusterError::Dispatch(DispatchError::EmulationDisabled))
        ));
    }

    #[test]
    fn test_listeners_without_emulation_go_to_transports() {
        let (cluster, factory) = build_cluster(2, &[], false);
        cluster.on("join", Arc::new(|_: &[Value]| {})).unwrap();
        assert_eq!(cluster.events().listener_count("join"), 0);
        assert_eq!(factory.created.lock().len(), 3);
        for transport in factory.created.lock().iter() {
            assert_eq!(*transport.listeners.lock(), vec!["join".to_string()]);
        }
    }
}
