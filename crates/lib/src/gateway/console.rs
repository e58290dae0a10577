//! Local console session: lines typed by the user become messages of the `console` channel,
//! and replies are printed by `ConsoleChannel`.

use crate::channels::{ChannelHandle, ConsoleChannel, Incoming, CONSOLE_TRANSPORT_ID};
use crate::config::Config;
use crate::gateway::server::Core;
use crate::routing::ChannelKey;
use std::sync::Arc;
use std::time::Duration;

pub const CONSOLE_CHANNEL_ID: &str = "console";

pub struct ConsoleSession {
    core: Core,
    author: String,
}

impl ConsoleSession {
    /// Start a session that routes through the given transport handle.
    pub async fn with_channel(config: Config, author: impl Into<String>, channel: Arc<dyn ChannelHandle>) -> Self {
        let core = Core::new(config);
        core.channel_registry
            .register(CONSOLE_TRANSPORT_ID.to_string(), channel)
            .await;
        Self {
            core,
            author: author.into(),
        }
    }

    pub async fn start(config: Config) -> Self {
        Self::with_channel(config, "you", Arc::new(ConsoleChannel::new())).await
    }

    fn key(&self) -> ChannelKey {
        ChannelKey {
            transport: CONSOLE_TRANSPORT_ID.to_string(),
            channel_id: CONSOLE_CHANNEL_ID.to_string(),
        }
    }

    /// Queue one line. Blank lines are ignored.
    pub async fn send(&self, line: &str) {
        let text = line.trim();
        if text.is_empty() {
            return;
        }
        self.core
            .dispatch(Incoming {
                transport: CONSOLE_TRANSPORT_ID.to_string(),
                channel_id: CONSOLE_CHANNEL_ID.to_string(),
                author_id: self.author.clone(),
                text: text.to_string(),
            })
            .await;
    }

    /// Wait until queued lines have been answered (or `limit` passes), then stop the scheduler.
    pub async fn finish(self, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        if let Some(scheduler) = self.core.schedulers.get(&self.key()).await {
            loop {
                let stats = scheduler.stats();
                if (stats.pending == 0 && !stats.in_flight) || tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(self.core.config.scheduler.tick_interval()).await;
            }
        }
        self.core.schedulers.shutdown().await;
    }
}
