//! Console channel: replies are printed to stdout. Used by `duet console`.

use crate::channels::registry::ChannelHandle;
use async_trait::async_trait;
use std::io::Write;

pub const CONSOLE_TRANSPORT_ID: &str = "console";

pub struct ConsoleChannel {
    id: String,
}

impl Default for ConsoleChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self {
            id: CONSOLE_TRANSPORT_ID.to_string(),
        }
    }
}

#[async_trait]
impl ChannelHandle for ConsoleChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {}

    async fn send_message(&self, _channel_id: &str, text: &str) -> Result<(), String> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "< {}", text.trim()).map_err(|e| e.to_string())?;
        out.flush().map_err(|e| e.to_string())
    }
}
