//! Communication channels (Telegram, console).
//!
//! Channel trait and registry so the gateway can start/stop connectors and deliver replies.
//! Inbound messages are sent to the gateway, which routes them to the channel's scheduler.

mod console;
mod inbound;
mod registry;
mod telegram;

pub use console::{ConsoleChannel, CONSOLE_TRANSPORT_ID};
pub use inbound::Incoming;
pub use registry::{ChannelHandle, ChannelRegistry};
pub use telegram::{TelegramChannel, TelegramUpdate, TELEGRAM_TRANSPORT_ID};
