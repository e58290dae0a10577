//! Channel routing: (transport, conversation) -> running scheduler.
//!
//! Inbound: a message is routed to its conversation's scheduler, spawned on first use when the
//! conversation is allowed. Outbound: each scheduler delivers through the transport that spawned it.
//! Schedulers that have been quiet for `idleReapSecs` are stopped and respawn on the next message.

use crate::buffer::{BufferPolicy, BufferStats};
use crate::channels::{ChannelHandle, Incoming, TELEGRAM_TRANSPORT_ID};
use crate::config::{ChannelRole, Config};
use crate::dialogue::{DialogueEngine, DialogueLimits, Voice};
use crate::llm::{ClientKey, ClientRegistry};
use crate::memory::MemoryStore;
use crate::scheduler::{Scheduler, SchedulerDeps, SchedulerError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on the time between two idle sweeps.
const REAP_SWEEP_EVERY: Duration = Duration::from_secs(60);

/// Transport id + conversation id (e.g. "telegram" + chat_id).
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct ChannelKey {
    pub transport: String,
    pub channel_id: String,
}

impl ChannelKey {
    pub fn of(incoming: &Incoming) -> Self {
        Self {
            transport: incoming.transport.clone(),
            channel_id: incoming.channel_id.clone(),
        }
    }
}

/// Status row for one running scheduler.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub transport: String,
    pub channel_id: String,
    pub role: ChannelRole,
    pub autonomous: bool,
    pub buffer: BufferStats,
}

struct Running {
    scheduler: Arc<Scheduler>,
    task: JoinHandle<()>,
    cancel: CancellationToken,
    /// Client registry holds taken for this scheduler's persona voices.
    holds: Vec<ClientKey>,
}

/// Role of a conversation, or None when the bot should ignore it.
pub fn channel_role(config: &Config, key: &ChannelKey) -> Option<ChannelRole> {
    if key.transport == TELEGRAM_TRANSPORT_ID {
        config.channels.telegram.role_for(&key.channel_id)
    } else {
        Some(ChannelRole::Respond)
    }
}

/// Whether a conversation may host autonomous dialogue. Telegram chats must be listed as
/// `respond` groups; chats admitted because the group list is empty only get replies.
pub fn runs_autonomous(config: &Config, key: &ChannelKey) -> bool {
    if key.transport == TELEGRAM_TRANSPORT_ID {
        config.channels.telegram.is_listed_respond(&key.channel_id)
    } else {
        true
    }
}

/// Running schedulers by conversation. Shared across the gateway.
pub struct SchedulerRegistry {
    config: Arc<Config>,
    clients: Arc<ClientRegistry>,
    memory: Arc<dyn MemoryStore>,
    cancel: CancellationToken,
    running: Arc<RwLock<HashMap<ChannelKey, Running>>>,
}

impl SchedulerRegistry {
    pub fn new(config: Arc<Config>, clients: Arc<ClientRegistry>, memory: Arc<dyn MemoryStore>) -> Self {
        Self {
            config,
            clients,
            memory,
            cancel: CancellationToken::new(),
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Buffer an inbound message in its conversation's scheduler, starting one if needed.
    /// The message is enqueued under the map lock so an idle sweep never stops a scheduler
    /// that has just been handed a message.
    pub async fn route(
        &self,
        incoming: Incoming,
        outbound: Arc<dyn ChannelHandle>,
    ) -> Result<u64, SchedulerError> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let key = ChannelKey::of(&incoming);
        {
            let g = self.running.read().await;
            if let Some(r) = g.get(&key) {
                return Ok(r.scheduler.enqueue(&incoming.author_id, &incoming.text));
            }
        }
        let role = channel_role(&self.config, &key)
            .ok_or_else(|| SchedulerError::NotAllowed(key.channel_id.clone()))?;
        self.spawn(key, role, outbound, &incoming).await
    }

    pub async fn get(&self, key: &ChannelKey) -> Option<Arc<Scheduler>> {
        let g = self.running.read().await;
        g.get(key).map(|r| r.scheduler.clone())
    }

    async fn spawn(
        &self,
        key: ChannelKey,
        role: ChannelRole,
        outbound: Arc<dyn ChannelHandle>,
        incoming: &Incoming,
    ) -> Result<u64, SchedulerError> {
        let (engine, holds) = self.build_engine().await;
        let mut g = self.running.write().await;
        if self.cancel.is_cancelled() {
            drop(g);
            self.release_holds(&holds).await;
            return Err(SchedulerError::ShuttingDown);
        }
        if let Some(existing) = g.get(&key) {
            let seq = existing.scheduler.enqueue(&incoming.author_id, &incoming.text);
            drop(g);
            self.release_holds(&holds).await;
            return Ok(seq);
        }
        let mut settings = self.config.scheduler.clone();
        if !runs_autonomous(&self.config, &key) {
            settings.autonomous_interval_secs = 0;
        }
        let policy = match role {
            ChannelRole::Respond => BufferPolicy::responding(&settings),
            ChannelRole::Collect => BufferPolicy::collecting(&self.config.collector),
        };
        let scheduler = Arc::new(Scheduler::new(
            key.channel_id.clone(),
            role,
            settings,
            policy,
            SchedulerDeps {
                engine,
                outbound,
                memory: self.memory.clone(),
            },
        ));
        log::info!(
            "routing: starting {:?} scheduler for {} {} (autonomous: {})",
            role,
            key.transport,
            key.channel_id,
            scheduler.autonomous_enabled()
        );
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(scheduler.clone().run(cancel.clone()));
        let seq = scheduler.enqueue(&incoming.author_id, &incoming.text);
        g.insert(
            key,
            Running {
                scheduler,
                task,
                cancel,
                holds,
            },
        );
        Ok(seq)
    }

    async fn build_engine(&self) -> (DialogueEngine, Vec<ClientKey>) {
        let agents = &self.config.agents;
        let a = self.clients.acquire(&agents.personas.a).await;
        let b = self.clients.acquire(&agents.personas.b).await;
        let holds = vec![
            ClientKey::for_persona(&agents.personas.a),
            ClientKey::for_persona(&agents.personas.b),
        ];
        let engine = DialogueEngine::new(
            Voice::new(&agents.personas.a, a),
            Voice::new(&agents.personas.b, b),
            agents.first_responder.into(),
            DialogueLimits::from_config(&self.config.scheduler),
        );
        (engine, holds)
    }

    async fn release_holds(&self, holds: &[ClientKey]) {
        for key in holds {
            self.clients.release(key).await;
        }
    }

    /// Cancel one scheduler, wait for its in-progress tick, and give its client holds back.
    async fn stop(&self, key: &ChannelKey, running: Running) {
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            log::warn!("routing: scheduler for {} ended abnormally: {}", key.channel_id, e);
        }
        self.release_holds(&running.holds).await;
    }

    /// Stop schedulers that have had nothing pending and no new message for `after`.
    /// Schedulers hosting autonomous dialogue are kept. Returns how many were stopped.
    pub async fn reap_idle(&self, after: Duration) -> usize {
        let reaped: Vec<(ChannelKey, Running)> = {
            let mut g = self.running.write().await;
            let idle: Vec<ChannelKey> = g
                .iter()
                .filter(|(_, r)| !r.scheduler.autonomous_enabled() && r.scheduler.is_idle_for(after))
                .map(|(k, _)| k.clone())
                .collect();
            idle.into_iter().filter_map(|k| g.remove_entry(&k)).collect()
        };
        let count = reaped.len();
        for (key, r) in reaped {
            log::info!("routing: stopping idle scheduler for {} {}", key.transport, key.channel_id);
            self.stop(&key, r).await;
        }
        count
    }

    /// Sweep for idle schedulers until shutdown. None when `idleReapSecs` is 0.
    pub fn start_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let after = self.config.scheduler.idle_reap()?;
        let every = after.min(REAP_SWEEP_EVERY);
        let registry = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = registry.cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {
                        let n = registry.reap_idle(after).await;
                        if n > 0 {
                            log::debug!("routing: reaped {} idle scheduler(s)", n);
                        }
                    }
                }
            }
        }))
    }

    pub async fn status(&self) -> Vec<ChannelStatus> {
        let g = self.running.read().await;
        let mut out: Vec<ChannelStatus> = g
            .iter()
            .map(|(k, r)| ChannelStatus {
                transport: k.transport.clone(),
                channel_id: k.channel_id.clone(),
                role: r.scheduler.role(),
                autonomous: r.scheduler.autonomous_enabled(),
                buffer: r.scheduler.stats(),
            })
            .collect();
        out.sort_by(|a, b| (&a.transport, &a.channel_id).cmp(&(&b.transport, &b.channel_id)));
        out
    }

    /// Stop every scheduler, wait for in-progress ticks, and give client holds back.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let running: Vec<(ChannelKey, Running)> = {
            let mut g = self.running.write().await;
            g.drain().collect()
        };
        for (key, r) in running {
            self.stop(&key, r).await;
        }
        log::info!("routing: all schedulers stopped");
    }
}
