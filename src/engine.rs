//! The persona engine: owns the conversation store and the decision engine,
//! coordinates transports and the generator, and runs the message pipeline
//! (append → ignore check → decide → generate → append → send).
//!
//! Transports push [`IncomingEvent`]s into a flume channel via an
//! [`EventSink`]; the run loop appends each user message in arrival order and
//! spawns the decide/generate/send tail per message so one slow conversation
//! never blocks another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, RwLock};

use crate::config::PersonaConfig;
use crate::error::{DoppelError, Result};
use crate::generator::{GenerationRequest, Generator};
use crate::persona::{ActiveHours, DecisionEngine, EntropyRandom, RandomSource};
use crate::store::{ConversationKey, ConversationStore, Role};

/// A message arriving from some transport.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub transport: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub meta: serde_json::Value,
}

/// Handed to a transport at construction so it can feed the engine.
#[derive(Clone)]
pub struct EventSink {
    transport: String,
    tx: flume::Sender<IncomingEvent>,
}

impl EventSink {
    pub(crate) fn for_transport(
        transport: impl Into<String>,
        tx: flume::Sender<IncomingEvent>,
    ) -> Self {
        Self {
            transport: transport.into(),
            tx,
        }
    }

    /// Queue an incoming message stamped with the current time.
    pub fn emit(&self, sender: impl Into<String>, content: impl Into<String>, meta: serde_json::Value) {
        self.emit_at(sender, content, Utc::now(), meta);
    }

    pub fn emit_at(
        &self,
        sender: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        meta: serde_json::Value,
    ) {
        let event = IncomingEvent {
            transport: self.transport.clone(),
            sender: sender.into(),
            content: content.into(),
            timestamp,
            meta,
        };
        if self.tx.send(event).is_err() {
            tracing::warn!("Engine event channel closed; dropping incoming message");
        }
    }
}

/// A platform channel the engine can receive from and send through.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Bring the transport up. The engine refuses to enter `Running` unless
    /// every registered transport starts.
    async fn start(&self) -> Result<()>;

    /// Tear the transport down. Must not fail; log problems internally.
    async fn stop(&self);

    /// Deliver text to a recipient. `Ok(true)` means the message left.
    async fn send(&self, recipient: &str, text: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: RunState,
    pub transports: Vec<String>,
    pub active_conversations: usize,
    pub generator: Option<String>,
}

pub struct PersonaEngine {
    config: PersonaConfig,
    store: Arc<ConversationStore>,
    decisions: Arc<DecisionEngine>,
    generator: RwLock<Option<Arc<dyn Generator>>>,
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    state: RwLock<RunState>,
    event_tx: flume::Sender<IncomingEvent>,
    event_rx: flume::Receiver<IncomingEvent>,
    // Replaced on every start so a restart cannot resurrect an old run loop.
    shutdown: RwLock<watch::Sender<bool>>,
}

impl PersonaEngine {
    pub async fn new(config: PersonaConfig) -> Arc<Self> {
        Self::with_random(config, Box::new(EntropyRandom::new())).await
    }

    /// Build an engine with an injected random source, so decisions are
    /// deterministic under test.
    pub async fn with_random(config: PersonaConfig, rng: Box<dyn RandomSource>) -> Arc<Self> {
        let active_hours = ActiveHours::parse(&config.active_hours_start, &config.active_hours_end)
            .unwrap_or_else(|| {
                tracing::warn!(
                    "Invalid active hours {:?}-{:?}, using defaults",
                    config.active_hours_start,
                    config.active_hours_end
                );
                ActiveHours::default()
            });

        let decisions = DecisionEngine::new(
            config.style.clone(),
            config.response_probability,
            config.response_triggers.clone(),
            active_hours,
            rng,
        );

        if config.traits.is_empty() {
            decisions.install_default_traits().await;
        } else {
            for persona_trait in config.traits.clone() {
                decisions.register_trait(persona_trait).await;
            }
        }
        for profile in config.relationships.clone() {
            decisions.register_relationship(profile).await;
        }

        let store = ConversationStore::new(
            config.context.max_messages_per_conversation,
            config.context.context_window_days,
        );
        let (event_tx, event_rx) = flume::unbounded();
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            config,
            store: Arc::new(store),
            decisions: Arc::new(decisions),
            generator: RwLock::new(None),
            transports: RwLock::new(HashMap::new()),
            state: RwLock::new(RunState::Stopped),
            event_tx,
            event_rx,
            shutdown: RwLock::new(shutdown),
        })
    }

    pub fn store(&self) -> Arc<ConversationStore> {
        self.store.clone()
    }

    pub fn decisions(&self) -> Arc<DecisionEngine> {
        self.decisions.clone()
    }

    pub fn config(&self) -> &PersonaConfig {
        &self.config
    }

    /// Sink for a transport registered (or about to be registered) under
    /// `transport_name`.
    pub fn event_sink(&self, transport_name: impl Into<String>) -> EventSink {
        EventSink {
            transport: transport_name.into(),
            tx: self.event_tx.clone(),
        }
    }

    pub async fn bind_generator(&self, generator: Arc<dyn Generator>) {
        tracing::info!("Generator bound: {}", generator.name());
        *self.generator.write().await = Some(generator);
    }

    pub async fn register_transport(&self, transport: Arc<dyn Transport>) {
        tracing::info!("Transport registered: {}", transport.name());
        self.transports
            .write()
            .await
            .insert(transport.name().to_string(), transport);
    }

    /// Start all registered transports (in parallel) and the run loop.
    /// A single transport failure aborts the start after best-effort stop of
    /// the transports that did come up.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != RunState::Stopped {
                return Err(DoppelError::AlreadyRunning);
            }
            if self.generator.read().await.is_none() {
                return Err(DoppelError::NoGenerator);
            }
            *state = RunState::Starting;
        }
        tracing::info!("Starting persona engine");

        if let Some(generator) = self.generator.read().await.clone() {
            if let Err(e) = generator.ensure_ready().await {
                tracing::warn!("Generator readiness check failed: {}", e);
            }
        }

        let transports: Vec<Arc<dyn Transport>> =
            self.transports.read().await.values().cloned().collect();
        let results = join_all(transports.iter().map(|t| t.start())).await;

        let mut failure: Option<DoppelError> = None;
        let mut started = Vec::new();
        for (transport, result) in transports.iter().zip(results) {
            match result {
                Ok(()) => started.push(transport.clone()),
                Err(e) => {
                    tracing::error!("Transport {} failed to start: {}", transport.name(), e);
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(error) = failure {
            for transport in started {
                transport.stop().await;
            }
            *self.state.write().await = RunState::Stopped;
            return Err(error);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        *self.shutdown.write().await = shutdown;
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_loop(shutdown_rx).await;
        });

        *self.state.write().await = RunState::Running;
        tracing::info!("Persona engine running ({} transports)", transports.len());
        Ok(())
    }

    /// Stop everything. Idempotent from any state; individual transport or
    /// generator failures are logged, never propagated.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if *state == RunState::Stopped {
                return;
            }
            *state = RunState::Stopping;
        }
        tracing::info!("Stopping persona engine");

        self.shutdown.read().await.send_replace(true);

        let transports: Vec<Arc<dyn Transport>> =
            self.transports.read().await.values().cloned().collect();
        for transport in transports {
            transport.stop().await;
        }

        if let Some(generator) = self.generator.read().await.clone() {
            generator.cleanup().await;
        }

        *self.state.write().await = RunState::Stopped;
        tracing::info!("Persona engine stopped");
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            state: *self.state.read().await,
            transports: self.transports.read().await.keys().cloned().collect(),
            active_conversations: self.store.active_conversations(7).await.len(),
            generator: self
                .generator
                .read()
                .await
                .as_ref()
                .map(|g| g.name().to_string()),
        }
    }

    /// Full pipeline for one inbound message. Returns the reply text when
    /// the persona chose to answer; `None` otherwise (not running, ignored
    /// sender, declined, or generation failed — failures are logged, never
    /// propagated across conversations).
    pub async fn handle_incoming(
        &self,
        transport: &str,
        sender: &str,
        content: &str,
        meta: serde_json::Value,
    ) -> Result<Option<String>> {
        let event = IncomingEvent {
            transport: transport.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            meta,
        };
        if *self.state.read().await != RunState::Running {
            return Ok(None);
        }

        let key = ConversationKey::new(&event.transport, &event.sender);
        self.store
            .append(&key, &event.content, Role::User, event.timestamp)
            .await;
        self.respond(&key, &event).await
    }

    async fn run_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut eviction = tokio::time::interval(Duration::from_secs(
            self.config.context.eviction_interval_secs.max(1),
        ));

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                result = self.event_rx.recv_async() => {
                    match result {
                        Ok(event) => self.ingest(event).await,
                        Err(_) => break,
                    }
                }
                _ = eviction.tick() => {
                    let removed = self.store.evict_stale(self.config.context.retention_days).await;
                    if removed > 0 {
                        tracing::info!("Evicted {} stale conversations", removed);
                    }
                }
            }
        }
        tracing::debug!("Engine run loop exited");
    }

    /// Append in arrival order, then answer on a spawned task.
    async fn ingest(self: &Arc<Self>, event: IncomingEvent) {
        if *self.state.read().await != RunState::Running {
            return;
        }

        let key = ConversationKey::new(&event.transport, &event.sender);
        self.store
            .append(&key, &event.content, Role::User, event.timestamp)
            .await;

        let engine = self.clone();
        tokio::spawn(async move {
            match engine.respond(&key, &event).await {
                Ok(Some(reply)) => engine.deliver(&event.transport, &event.sender, &reply).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Pipeline error for {}: {}", key, e);
                }
            }
        });
    }

    async fn respond(&self, key: &ConversationKey, event: &IncomingEvent) -> Result<Option<String>> {
        if self.config.ignore_senders.iter().any(|s| s == &event.sender) {
            tracing::debug!("Ignoring message from {}", event.sender);
            return Ok(None);
        }

        let decision = self
            .decisions
            .decide(&event.sender, &event.content, Utc::now())
            .await;
        if !decision.should_respond {
            tracing::debug!(
                "Declined to respond to {} (p={:.3})",
                event.sender,
                decision.probability
            );
            return Ok(None);
        }

        let generator = match self.generator.read().await.clone() {
            Some(generator) => generator,
            None => return Err(DoppelError::NoGenerator),
        };

        let request = GenerationRequest {
            channel: event.transport.clone(),
            sender: event.sender.clone(),
            content: event.content.clone(),
            meta: event.meta.clone(),
            context: decision.context,
            history: self.store.history(key, None).await,
        };

        let timeout = Duration::from_secs(self.config.generator.timeout_secs);
        let outcome = match tokio::time::timeout(timeout, generator.generate(&request)).await {
            Ok(result) => result,
            Err(_) => Err(DoppelError::Timeout(timeout)),
        };

        let text = match outcome {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Generation failed for {}: {}", key, e);
                return Ok(None);
            }
        };

        let reply = text.trim();
        if reply.is_empty() {
            tracing::error!("Generation failed for {}: {}", key, DoppelError::EmptyResponse);
            return Ok(None);
        }

        self.store
            .append(key, reply, Role::Assistant, Utc::now())
            .await;
        Ok(Some(reply.to_string()))
    }

    /// Best-effort outbound delivery. A failing transport is dropped from
    /// the registry; other transports are unaffected.
    async fn deliver(&self, transport_name: &str, recipient: &str, text: &str) {
        let transport = self.transports.read().await.get(transport_name).cloned();
        let Some(transport) = transport else {
            tracing::warn!("No transport named {} to deliver through", transport_name);
            return;
        };

        match transport.send(recipient, text).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("Transport {} did not deliver to {}", transport_name, recipient);
            }
            Err(e) => {
                tracing::error!(
                    "Transport {} send failed, marking inactive: {}",
                    transport_name,
                    e
                );
                self.transports.write().await.remove(transport_name);
            }
        }
    }
}

/// In-process transport: incoming messages are pushed through the sink by
/// the embedding code, outgoing replies land on a flume channel.
pub struct ChannelTransport {
    name: String,
    outbox: flume::Sender<(String, String)>,
}

impl ChannelTransport {
    pub fn new(name: impl Into<String>) -> (Self, flume::Receiver<(String, String)>) {
        let (outbox, rx) = flume::unbounded();
        (
            Self {
                name: name.into(),
                outbox,
            },
            rx,
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn send(&self, recipient: &str, text: &str) -> Result<bool> {
        self.outbox
            .send((recipient.to_string(), text.to_string()))
            .map_err(|e| DoppelError::transport(&self.name, e))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::FixedRandom;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StaticGenerator(&'static str);

    #[async_trait]
    impl Generator for StaticGenerator {
        fn name(&self) -> &str {
            "static"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl Generator for FailingGenerator {
        fn name(&self) -> &str {
            "failing"
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
            Err(DoppelError::Unavailable)
        }
    }

    struct CountingRandom {
        draws: Arc<AtomicUsize>,
        value: f64,
    }

    impl RandomSource for CountingRandom {
        fn draw(&mut self) -> f64 {
            self.draws.fetch_add(1, Ordering::SeqCst);
            self.value
        }
    }

    struct FlakyTransport {
        name: String,
        fail_start: bool,
        started: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    impl FlakyTransport {
        fn new(name: &str, fail_start: bool) -> (Arc<Self>, Arc<AtomicBool>, Arc<AtomicBool>) {
            let started = Arc::new(AtomicBool::new(false));
            let stopped = Arc::new(AtomicBool::new(false));
            (
                Arc::new(Self {
                    name: name.to_string(),
                    fail_start,
                    started: started.clone(),
                    stopped: stopped.clone(),
                }),
                started,
                stopped,
            )
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(DoppelError::transport(&self.name, "refused"));
            }
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        async fn send(&self, _recipient: &str, _text: &str) -> Result<bool> {
            Ok(true)
        }
    }

    async fn engine(draw: f64) -> Arc<PersonaEngine> {
        PersonaEngine::with_random(PersonaConfig::default(), Box::new(FixedRandom(draw))).await
    }

    #[tokio::test]
    async fn start_requires_a_generator() {
        let engine = engine(0.0).await;
        assert!(matches!(engine.start().await, Err(DoppelError::NoGenerator)));
        assert_eq!(engine.status().await.state, RunState::Stopped);
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_stop_is_idempotent() {
        let engine = engine(0.0).await;
        engine.bind_generator(Arc::new(StaticGenerator("ok"))).await;

        engine.start().await.unwrap();
        assert!(matches!(
            engine.start().await,
            Err(DoppelError::AlreadyRunning)
        ));

        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.status().await.state, RunState::Stopped);

        // A stopped engine can be started again.
        engine.start().await.unwrap();
        engine.stop().await;
    }

    #[tokio::test]
    async fn not_running_means_no_op() {
        let engine = engine(0.0).await;
        engine.bind_generator(Arc::new(StaticGenerator("ok"))).await;

        let reply = engine
            .handle_incoming("test", "alice", "hello", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(reply.is_none());

        let key = ConversationKey::new("test", "alice");
        assert!(engine.store().history(&key, None).await.is_empty());
    }

    #[tokio::test]
    async fn ignored_sender_never_reaches_the_decision() {
        let draws = Arc::new(AtomicUsize::new(0));
        let mut config = PersonaConfig::default();
        config.ignore_senders.push("spammer".to_string());
        let engine = PersonaEngine::with_random(
            config,
            Box::new(CountingRandom {
                draws: draws.clone(),
                value: 0.0,
            }),
        )
        .await;
        engine.bind_generator(Arc::new(StaticGenerator("ok"))).await;
        engine.start().await.unwrap();

        let reply = engine
            .handle_incoming("test", "spammer", "please help urgent", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(reply.is_none());
        // Trigger words never bypassed the ignore list: no draw happened.
        assert_eq!(draws.load(Ordering::SeqCst), 0);

        // The message still lands in history, unanswered.
        let key = ConversationKey::new("test", "spammer");
        let history = engine.store().history(&key, None).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);

        engine.stop().await;
    }

    #[tokio::test]
    async fn successful_reply_is_appended_and_returned() {
        let engine = engine(0.0).await;
        engine
            .bind_generator(Arc::new(StaticGenerator("sounds good!")))
            .await;
        engine.start().await.unwrap();

        let reply = engine
            .handle_incoming("test", "mara", "lunch tomorrow?", serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("sounds good!"));

        let key = ConversationKey::new("test", "mara");
        let history = engine.store().history(&key, None).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "sounds good!");

        engine.stop().await;
    }

    #[tokio::test]
    async fn declined_decision_yields_no_reply() {
        // Draw 1.0 always loses the comparison.
        let engine = engine(1.0).await;
        engine.bind_generator(Arc::new(StaticGenerator("unused"))).await;
        engine.start().await.unwrap();

        let reply = engine
            .handle_incoming("test", "mara", "hi", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(reply.is_none());

        let key = ConversationKey::new("test", "mara");
        assert_eq!(engine.store().history(&key, None).await.len(), 1);

        engine.stop().await;
    }

    #[tokio::test]
    async fn generation_failure_degrades_to_silence() {
        let engine = engine(0.0).await;
        engine.bind_generator(Arc::new(FailingGenerator)).await;
        engine.start().await.unwrap();

        let reply = engine
            .handle_incoming("test", "mara", "hello", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(reply.is_none());

        // The unanswered user message stays in history.
        let key = ConversationKey::new("test", "mara");
        let history = engine.store().history(&key, None).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);

        engine.stop().await;
    }

    #[tokio::test]
    async fn blank_generation_is_treated_as_failure() {
        let engine = engine(0.0).await;
        engine.bind_generator(Arc::new(StaticGenerator("   \n  "))).await;
        engine.start().await.unwrap();

        let reply = engine
            .handle_incoming("test", "mara", "hello", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(reply.is_none());
        let key = ConversationKey::new("test", "mara");
        assert_eq!(engine.store().history(&key, None).await.len(), 1);

        engine.stop().await;
    }

    #[tokio::test]
    async fn transport_start_failure_aborts_and_rolls_back() {
        let engine = engine(0.0).await;
        engine.bind_generator(Arc::new(StaticGenerator("ok"))).await;

        let (good, good_started, good_stopped) = FlakyTransport::new("good", false);
        let (bad, _, _) = FlakyTransport::new("bad", true);
        engine.register_transport(good).await;
        engine.register_transport(bad).await;

        let result = engine.start().await;
        assert!(matches!(result, Err(DoppelError::Transport { .. })));
        assert_eq!(engine.status().await.state, RunState::Stopped);

        // The transport that did start was stopped again.
        assert!(good_started.load(Ordering::SeqCst));
        assert!(good_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn run_loop_delivers_replies_through_the_transport() {
        let engine = engine(0.0).await;
        engine
            .bind_generator(Arc::new(StaticGenerator("on my way")))
            .await;

        let (transport, outbox) = ChannelTransport::new("chat");
        engine.register_transport(Arc::new(transport)).await;
        engine.start().await.unwrap();

        let sink = engine.event_sink("chat");
        sink.emit("mara", "are you coming?", serde_json::Value::Null);

        let (recipient, text) =
            tokio::time::timeout(Duration::from_secs(5), outbox.recv_async())
                .await
                .expect("reply within timeout")
                .expect("channel open");
        assert_eq!(recipient, "mara");
        assert_eq!(text, "on my way");

        let key = ConversationKey::new("chat", "mara");
        let history = engine.store().history(&key, None).await;
        assert_eq!(history.len(), 2);

        engine.stop().await;
    }

    #[tokio::test]
    async fn status_reports_engine_shape() {
        let engine = engine(0.0).await;
        engine.bind_generator(Arc::new(StaticGenerator("ok"))).await;
        let (transport, _outbox) = ChannelTransport::new("chat");
        engine.register_transport(Arc::new(transport)).await;

        let status = engine.status().await;
        assert_eq!(status.state, RunState::Stopped);
        assert_eq!(status.transports, vec!["chat".to_string()]);
        assert_eq!(status.generator.as_deref(), Some("static"));
        assert_eq!(status.active_conversations, 0);
    }
}
