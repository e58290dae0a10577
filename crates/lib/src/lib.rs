//! Duet core library: per-channel message batching, the dispatch scheduler, and the bounded
//! two-persona dialogue engine, plus the transports, LLM clients and gateway around them.

pub mod buffer;
pub mod channels;
pub mod config;
pub mod dialogue;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod memory;
pub mod routing;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;
