//! Per-channel dispatch scheduler.
//!
//! One `Scheduler` per conversation. `run` ticks on a fixed interval; each tick may start an
//! autonomous dialogue (when its interval has elapsed and the channel is idle) and then flushes
//! the buffer and answers the batch. Both paths hold the buffer's single-flight slot, so they
//! never overlap. Replies are delivered in production order and remembered; delivery and memory
//! are independent and best-effort.

use crate::buffer::{BufferPolicy, BufferStats, ChannelBuffer, InboundMessage};
use crate::channels::ChannelHandle;
use crate::config::{ChannelRole, ReplyMode, SchedulerConfig};
use crate::dialogue::{DialogueEngine, Mode, Seed, Utterance};
use crate::memory::{MemoryEntry, MemoryStore};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const SOURCE_GROUP_CHAT: &str = "group_chat";
pub const SOURCE_AUTONOMOUS: &str = "autonomous_dialogue";
pub const SOURCE_REPLY: &str = "reply";
pub const SOURCE_COLLECTOR: &str = "collector";

/// Cooldown horizon used when the configured cooldown does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("tick panicked: {0}")]
    TickPanicked(String),
    #[error("tick was cancelled")]
    TickCancelled,
    #[error("channel {0} is not allowed")]
    NotAllowed(String),
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl From<JoinError> for SchedulerError {
    fn from(e: JoinError) -> Self {
        if e.is_panic() {
            let payload = e.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            SchedulerError::TickPanicked(msg)
        } else {
            SchedulerError::TickCancelled
        }
    }
}

/// What one tick did; counts are utterances delivered (or messages collected).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub autonomous: Option<usize>,
    pub reactive: Option<usize>,
    pub collected: Option<usize>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.autonomous.is_none() && self.reactive.is_none() && self.collected.is_none()
    }
}

struct AutonomousClock {
    last_run: Instant,
    cooldown_until: Option<Instant>,
}

/// Collaborators a scheduler talks to.
pub struct SchedulerDeps {
    pub engine: DialogueEngine,
    pub outbound: Arc<dyn ChannelHandle>,
    pub memory: Arc<dyn MemoryStore>,
}

pub struct Scheduler {
    channel_id: String,
    role: ChannelRole,
    settings: SchedulerConfig,
    buffer: ChannelBuffer,
    deps: SchedulerDeps,
    next_sequence: AtomicU64,
    clock: Mutex<AutonomousClock>,
    last_inbound: Mutex<Instant>,
}

fn pick_topic(topics: &[String]) -> Option<String> {
    topics.choose(&mut rand::thread_rng()).cloned()
}

fn jitter_delay(range: (Duration, Duration)) -> Duration {
    let (lo, hi) = range;
    if lo >= hi {
        return lo;
    }
    rand::thread_rng().gen_range(lo..=hi)
}

impl Scheduler {
    pub fn new(
        channel_id: impl Into<String>,
        role: ChannelRole,
        settings: SchedulerConfig,
        policy: BufferPolicy,
        deps: SchedulerDeps,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            role,
            settings,
            buffer: ChannelBuffer::new(policy),
            deps,
            next_sequence: AtomicU64::new(1),
            clock: Mutex::new(AutonomousClock {
                last_run: Instant::now(),
                cooldown_until: None,
            }),
            last_inbound: Mutex::new(Instant::now()),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    pub fn buffer(&self) -> &ChannelBuffer {
        &self.buffer
    }

    pub fn autonomous_enabled(&self) -> bool {
        self.role == ChannelRole::Respond && self.settings.autonomous_interval().is_some()
    }

    /// True when nothing is pending or in flight and no message arrived for `after`.
    pub fn is_idle_for(&self, after: Duration) -> bool {
        let stats = self.buffer.stats();
        if stats.pending > 0 || stats.in_flight {
            return false;
        }
        let last = *self.last_inbound.lock().unwrap_or_else(|p| p.into_inner());
        last.elapsed() >= after
    }

    /// Stamp an inbound message with the next sequence id and buffer it.
    pub fn enqueue(&self, author_id: &str, text: &str) -> u64 {
        let sequence_id = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        *self.last_inbound.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
        self.buffer.enqueue(InboundMessage::new(
            self.channel_id.clone(),
            author_id,
            text,
            sequence_id,
        ));
        sequence_id
    }

    /// Tick until cancelled. A tick in progress when cancellation arrives runs to completion.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        log::info!("scheduler: started for channel {} ({:?})", self.channel_id, self.role);
        while !cancel.is_cancelled() {
            let this = self.clone();
            let pause = match tokio::spawn(async move { this.tick().await }).await {
                Ok(report) => {
                    if !report.is_idle() {
                        log::debug!("scheduler: channel {} tick: {:?}", self.channel_id, report);
                    }
                    self.settings.tick_interval()
                }
                Err(e) => {
                    let err = SchedulerError::from(e);
                    log::error!("scheduler: channel {}: {}; backing off", self.channel_id, err);
                    self.settings.error_backoff()
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        log::info!("scheduler: stopped for channel {}", self.channel_id);
    }

    /// One pass: autonomous dialogue when due, then the reactive flush.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if self.role == ChannelRole::Respond {
            report.autonomous = self.autonomous_step().await;
        }
        match self.role {
            ChannelRole::Respond => report.reactive = self.reactive_step().await,
            ChannelRole::Collect => report.collected = self.collect_step().await,
        }
        report
    }

    fn autonomous_due(&self, now: Instant) -> bool {
        let Some(interval) = self.settings.autonomous_interval() else {
            return false;
        };
        let clock = self.clock.lock().unwrap_or_else(|p| p.into_inner());
        if now.duration_since(clock.last_run) < interval {
            return false;
        }
        clock.cooldown_until.map_or(true, |until| now >= until)
    }

    async fn autonomous_step(&self) -> Option<usize> {
        let now = Instant::now();
        if !self.autonomous_due(now) {
            return None;
        }
        let _slot = self.buffer.try_acquire()?;
        {
            let mut clock = self.clock.lock().unwrap_or_else(|p| p.into_inner());
            clock.last_run = now;
        }
        let Some(topic) = pick_topic(&self.settings.topics) else {
            log::debug!("scheduler: no topics configured, skipping autonomous dialogue");
            return None;
        };
        log::info!("scheduler: channel {} autonomous dialogue on {:?}", self.channel_id, topic);
        let utterances = self
            .deps
            .engine
            .run(Mode::Autonomous, &Seed::Topic(topic.clone()))
            .await;
        if utterances.is_empty() {
            let cooldown = self.settings.autonomous_failure_cooldown();
            log::warn!(
                "scheduler: channel {} autonomous dialogue produced nothing; cooling down for {:?}",
                self.channel_id,
                cooldown
            );
            let mut clock = self.clock.lock().unwrap_or_else(|p| p.into_inner());
            let now = Instant::now();
            clock.cooldown_until = now
                .checked_add(cooldown)
                .or_else(|| now.checked_add(FAR_FUTURE));
            return Some(0);
        }
        for u in &utterances {
            tokio::time::sleep(jitter_delay(self.settings.jitter_range())).await;
            self.deliver(&u.text).await;
            self.remember(utterance_entry(u, SOURCE_AUTONOMOUS).with_meta("topic", topic.as_str()))
                .await;
        }
        Some(utterances.len())
    }

    async fn reactive_step(&self) -> Option<usize> {
        let mut flight = self.buffer.try_flush()?;
        let batch = flight.take_batch()?;
        log::info!(
            "scheduler: channel {} flushing {} message(s), {} chars",
            self.channel_id,
            batch.len(),
            batch.char_count()
        );
        let context = if self.settings.recall_top_k > 0 {
            self.deps
                .memory
                .recall(batch.last_text(), self.settings.recall_top_k)
                .await
                .into_iter()
                .map(|e| e.text)
                .collect()
        } else {
            Vec::new()
        };
        let seed = Seed::from_batch(&batch, context);
        let utterances: Vec<Utterance> = match self.settings.reply_mode {
            ReplyMode::Dialogue => self.deps.engine.run(Mode::Reactive, &seed).await,
            ReplyMode::Direct => self.deps.engine.reply_direct(&seed).await.into_iter().collect(),
        };
        if utterances.is_empty() {
            log::warn!(
                "scheduler: channel {} batch {}..{} got no reply",
                self.channel_id,
                batch.first_sequence(),
                batch.last_sequence()
            );
            if let Some(notice) = &self.settings.failure_notice {
                self.deliver(notice).await;
            }
        }
        for u in &utterances {
            self.deliver(&u.text).await;
            self.remember(utterance_entry(u, SOURCE_REPLY)).await;
        }
        self.remember(
            MemoryEntry::new(batch.transcript(), SOURCE_GROUP_CHAT)
                .with_meta("channelId", self.channel_id.as_str())
                .with_meta("messageCount", batch.len()),
        )
        .await;
        Some(utterances.len())
    }

    async fn collect_step(&self) -> Option<usize> {
        let mut flight = self.buffer.try_flush()?;
        let batch = flight.take_batch()?;
        log::info!(
            "scheduler: channel {} collected {} message(s), {} chars",
            self.channel_id,
            batch.len(),
            batch.char_count()
        );
        self.remember(
            MemoryEntry::new(batch.transcript(), SOURCE_COLLECTOR)
                .with_meta("channelId", self.channel_id.as_str())
                .with_meta("messageCount", batch.len()),
        )
        .await;
        Some(batch.len())
    }

    async fn deliver(&self, text: &str) {
        if let Err(e) = self.deps.outbound.send_message(&self.channel_id, text).await {
            log::warn!("scheduler: delivery to channel {} failed: {}", self.channel_id, e);
        }
    }

    async fn remember(&self, entry: MemoryEntry) {
        if let Err(e) = self.deps.memory.remember(entry).await {
            log::warn!("scheduler: remembering for channel {} failed: {}", self.channel_id, e);
        }
    }
}

fn utterance_entry(u: &Utterance, source: &str) -> MemoryEntry {
    let mut entry = MemoryEntry::new(u.text.clone(), source).with_meta("persona", u.persona.as_str());
    entry.timestamp = u.produced_at;
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::{DialogueLimits, Persona, Voice};
    use crate::test_support::{RecordingChannel, RecordingStore, ScriptedGateway};

    fn settings() -> SchedulerConfig {
        SchedulerConfig {
            autonomous_interval_secs: 0,
            jitter_min_millis: 0,
            jitter_max_millis: 0,
            ..SchedulerConfig::default()
        }
    }

    fn voice(name: &str, gateway: Arc<ScriptedGateway>) -> Voice {
        Voice {
            name: name.to_string(),
            system_prompt: String::new(),
            follow_up: "go on".to_string(),
            gateway,
        }
    }

    struct Rig {
        a: Arc<ScriptedGateway>,
        b: Arc<ScriptedGateway>,
        channel: Arc<RecordingChannel>,
        store: Arc<RecordingStore>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                a: ScriptedGateway::chatty("a"),
                b: ScriptedGateway::chatty("b"),
                channel: RecordingChannel::new(),
                store: RecordingStore::new(),
            }
        }

        fn scheduler(&self, role: ChannelRole, settings: SchedulerConfig) -> Arc<Scheduler> {
            let engine = DialogueEngine::new(
                voice("a", self.a.clone()),
                voice("b", self.b.clone()),
                Persona::A,
                DialogueLimits::from_config(&settings),
            );
            let policy = match role {
                ChannelRole::Respond => BufferPolicy::responding(&settings),
                ChannelRole::Collect => BufferPolicy::collecting(&Default::default()),
            };
            Arc::new(Scheduler::new(
                "chat-1",
                role,
                settings,
                policy,
                SchedulerDeps {
                    engine,
                    outbound: self.channel.clone(),
                    memory: self.store.clone(),
                },
            ))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_assigns_increasing_sequence_ids() {
        let rig = Rig::new();
        let s = rig.scheduler(ChannelRole::Respond, settings());
        assert_eq!(s.enqueue("ana", "one"), 1);
        assert_eq!(s.enqueue("ben", "two"), 2);
        assert_eq!(s.stats().pending, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_tick_does_nothing() {
        let rig = Rig::new();
        let s = rig.scheduler(ChannelRole::Respond, settings());
        assert!(s.tick().await.is_idle());
        assert!(rig.channel.texts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reactive_tick_delivers_in_order_and_remembers() {
        let rig = Rig::new();
        let s = rig.scheduler(ChannelRole::Respond, settings());
        for i in 0..5 {
            s.enqueue("ana", &format!("message {}", i));
        }
        let report = s.tick().await;
        assert_eq!(report.reactive, Some(2));
        assert_eq!(rig.channel.texts(), vec!["a says #1", "b says #1"]);
        assert!(rig.channel.sent().iter().all(|(id, _)| id == "chat-1"));
        assert_eq!(rig.store.sources(), vec!["reply", "reply", "group_chat"]);
        let batch_entry = rig.store.entries().pop().unwrap();
        assert_eq!(batch_entry.metadata["messageCount"], 5);
        assert!(!s.buffer().is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn max_wait_flush_happens_on_a_later_tick() {
        let rig = Rig::new();
        let s = rig.scheduler(ChannelRole::Respond, settings());
        s.enqueue("ana", "anyone?");
        assert_eq!(s.tick().await.reactive, None);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(s.tick().await.reactive, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn recall_uses_last_message_and_feeds_prompt() {
        let mut rig = Rig::new();
        rig.store = RecordingStore::with_recall(&["we talked about tides"]);
        let s = rig.scheduler(ChannelRole::Respond, settings());
        for i in 0..5 {
            s.enqueue("ana", &format!("line {}", i));
        }
        s.tick().await;
        assert_eq!(rig.store.queries(), vec!["line 4"]);
        assert!(rig.a.seen()[0][1].content.contains("we talked about tides"));
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_does_not_stop_memory() {
        let mut rig = Rig::new();
        rig.channel = RecordingChannel::failing();
        let s = rig.scheduler(ChannelRole::Respond, settings());
        for i in 0..5 {
            s.enqueue("ana", &format!("m{}", i));
        }
        assert_eq!(s.tick().await.reactive, Some(2));
        assert_eq!(rig.store.entries().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_failure_does_not_stop_delivery() {
        let mut rig = Rig::new();
        rig.store = RecordingStore::failing();
        let s = rig.scheduler(ChannelRole::Respond, settings());
        for i in 0..5 {
            s.enqueue("ana", &format!("m{}", i));
        }
        s.tick().await;
        assert_eq!(rig.channel.texts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_sends_notice_when_configured() {
        let mut rig = Rig::new();
        rig.a = ScriptedGateway::failing("a");
        let s = rig.scheduler(
            ChannelRole::Respond,
            SchedulerConfig {
                failure_notice: Some("thinking is hard today".to_string()),
                ..settings()
            },
        );
        for i in 0..5 {
            s.enqueue("ana", &format!("m{}", i));
        }
        assert_eq!(s.tick().await.reactive, Some(0));
        assert_eq!(rig.channel.texts(), vec!["thinking is hard today"]);
        assert_eq!(rig.b.calls(), 0);
        assert!(!s.buffer().is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_is_silent_by_default_and_not_requeued() {
        let mut rig = Rig::new();
        rig.a = ScriptedGateway::failing("a");
        let s = rig.scheduler(ChannelRole::Respond, settings());
        for i in 0..5 {
            s.enqueue("ana", &format!("m{}", i));
        }
        s.tick().await;
        assert!(rig.channel.texts().is_empty());
        assert_eq!(s.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn direct_mode_sends_a_single_reply() {
        let rig = Rig::new();
        let s = rig.scheduler(
            ChannelRole::Respond,
            SchedulerConfig {
                reply_mode: ReplyMode::Direct,
                ..settings()
            },
        );
        for i in 0..5 {
            s.enqueue("ana", &format!("m{}", i));
        }
        assert_eq!(s.tick().await.reactive, Some(1));
        assert_eq!(rig.channel.texts(), vec!["a says #1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn collector_remembers_batches_without_generating() {
        let rig = Rig::new();
        let s = rig.scheduler(
            ChannelRole::Collect,
            SchedulerConfig {
                autonomous_interval_secs: 10,
                ..settings()
            },
        );
        s.enqueue("ana", "note one");
        s.enqueue("ben", "note two");
        tokio::time::advance(Duration::from_secs(1800)).await;
        let report = s.tick().await;
        assert_eq!(report.collected, Some(2));
        assert_eq!(report.autonomous, None);
        assert_eq!(rig.a.calls() + rig.b.calls(), 0);
        assert!(rig.channel.texts().is_empty());
        let entry = &rig.store.entries()[0];
        assert_eq!(entry.source, "collector");
        assert_eq!(entry.text, "ana: note one\nben: note two");
    }

    #[tokio::test(start_paused = true)]
    async fn autonomous_dialogue_runs_after_interval() {
        let rig = Rig::new();
        let s = rig.scheduler(
            ChannelRole::Respond,
            SchedulerConfig {
                autonomous_interval_secs: 10,
                topics: vec!["tides".to_string()],
                ..settings()
            },
        );
        assert_eq!(s.tick().await.autonomous, None);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(s.tick().await.autonomous, Some(3));
        assert_eq!(rig.channel.texts().len(), 3);
        let entries = rig.store.entries();
        assert!(entries.iter().all(|e| e.source == "autonomous_dialogue"));
        assert_eq!(entries[0].metadata["topic"], "tides");
        let personas: Vec<_> = entries.iter().map(|e| e.metadata["persona"].clone()).collect();
        assert_ne!(personas[0], personas[1]);
        assert_eq!(personas[0], personas[2]);
        assert_eq!(s.tick().await.autonomous, None);
    }

    #[tokio::test(start_paused = true)]
    async fn autonomous_failure_applies_cooldown() {
        let mut rig = Rig::new();
        rig.a = ScriptedGateway::failing("a");
        rig.b = ScriptedGateway::failing("b");
        let s = rig.scheduler(
            ChannelRole::Respond,
            SchedulerConfig {
                autonomous_interval_secs: 10,
                autonomous_failure_cooldown_secs: 30,
                ..settings()
            },
        );
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(s.tick().await.autonomous, Some(0));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(s.tick().await.autonomous, None);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(s.tick().await.autonomous, Some(0));
        assert_eq!(rig.a.calls() + rig.b.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_failure_cooldown_saturates_instead_of_panicking() {
        let mut rig = Rig::new();
        rig.a = ScriptedGateway::failing("a");
        rig.b = ScriptedGateway::failing("b");
        let s = rig.scheduler(
            ChannelRole::Respond,
            SchedulerConfig {
                autonomous_interval_secs: 10,
                autonomous_failure_cooldown_secs: u64::MAX,
                ..settings()
            },
        );
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(s.tick().await.autonomous, Some(0));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(s.tick().await.autonomous, None);
        assert_eq!(rig.a.calls() + rig.b.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_only_after_quiet_period_with_empty_buffer() {
        let rig = Rig::new();
        let s = rig.scheduler(ChannelRole::Respond, settings());
        let quiet = Duration::from_secs(60);
        s.enqueue("ana", "still here");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!s.is_idle_for(quiet));
        assert_eq!(s.tick().await.reactive, Some(2));
        assert!(s.is_idle_for(quiet));
        s.enqueue("ben", "me too");
        assert!(!s.is_idle_for(quiet));
        tokio::time::advance(quiet).await;
        assert_eq!(s.tick().await.reactive, Some(2));
        let held = s.buffer().try_acquire().unwrap();
        assert!(!s.is_idle_for(quiet));
        drop(held);
        assert!(s.is_idle_for(quiet));
    }

    #[tokio::test(start_paused = true)]
    async fn autonomous_waits_while_a_batch_is_in_flight() {
        let rig = Rig::new();
        let s = rig.scheduler(
            ChannelRole::Respond,
            SchedulerConfig {
                autonomous_interval_secs: 10,
                ..settings()
            },
        );
        tokio::time::advance(Duration::from_secs(10)).await;
        let held = s.buffer().try_acquire().unwrap();
        assert_eq!(s.tick().await.autonomous, None);
        drop(held);
        assert_eq!(s.tick().await.autonomous, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_survives_a_panicking_tick_and_stops_on_cancel() {
        let mut rig = Rig::new();
        rig.a = ScriptedGateway::panicking("a");
        let s = rig.scheduler(ChannelRole::Respond, settings());
        for i in 0..5 {
            s.enqueue("ana", &format!("m{}", i));
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(s.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rig.a.calls(), 1);
        assert!(!s.buffer().is_in_flight());

        for i in 0..5 {
            s.enqueue("ana", &format!("again {}", i));
        }
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(rig.a.calls(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn join_error_panic_message_is_kept() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let err = rt.block_on(async { tokio::spawn(async { panic!("kaboom") }).await.unwrap_err() });
        match SchedulerError::from(err) {
            SchedulerError::TickPanicked(msg) => assert_eq!(msg, "kaboom"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
