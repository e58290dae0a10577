//! Inbound text from a channel, before the scheduler stamps it into an `InboundMessage`.

/// A message from a transport, addressed to one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incoming {
    /// Transport connector id (e.g. "telegram", "console").
    pub transport: String,
    /// Conversation the message belongs to (e.g. Telegram chat id).
    pub channel_id: String,
    pub author_id: String,
    pub text: String,
}
