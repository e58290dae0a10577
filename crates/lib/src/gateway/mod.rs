//! Gateway: HTTP control plane plus the local console session.
//!
//! Both own the same core: memory store, LLM client registry, transports, and one scheduler per
//! conversation.

mod console;
mod server;

pub use console::{ConsoleSession, CONSOLE_CHANNEL_ID};
pub use server::{run_gateway, GatewayState};
