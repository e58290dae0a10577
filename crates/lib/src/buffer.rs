//! Per-channel aggregation buffer.
//!
//! Inbound messages accumulate in `pending` until a trigger fires (characters, count, or time
//! since the last flush). A flush hands the whole pending list out as one `Batch` and marks the
//! channel in flight; no second flush can start until the returned `InFlight` guard is dropped
//! or `release()` is called. Autonomous runs take the same slot with `try_acquire()`.
//!
//! State sits behind a `std::sync::Mutex`: every critical section is plain bookkeeping and the
//! lock is never held across an await, which lets the guard release from `Drop`.

use crate::config::{CollectorConfig, SchedulerConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// One message accepted into a channel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub text: String,
    pub author_id: String,
    pub channel_id: String,
    pub received_at: DateTime<Utc>,
    /// Monotonic per channel, assigned at intake.
    pub sequence_id: u64,
}

impl InboundMessage {
    pub fn new(
        channel_id: impl Into<String>,
        author_id: impl Into<String>,
        text: impl Into<String>,
        sequence_id: u64,
    ) -> Self {
        Self {
            text: text.into(),
            author_id: author_id.into(),
            channel_id: channel_id.into(),
            received_at: Utc::now(),
            sequence_id,
        }
    }

    fn chars(&self) -> usize {
        self.text.chars().count()
    }
}

/// Messages flushed together, in receipt order. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    messages: Vec<InboundMessage>,
}

impl Batch {
    pub fn messages(&self) -> &[InboundMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn char_count(&self) -> usize {
        self.messages.iter().map(InboundMessage::chars).sum()
    }

    pub fn first_sequence(&self) -> u64 {
        self.messages.first().map(|m| m.sequence_id).unwrap_or_default()
    }

    pub fn last_sequence(&self) -> u64 {
        self.messages.last().map(|m| m.sequence_id).unwrap_or_default()
    }

    /// Text of the most recent message (used as the memory recall query).
    pub fn last_text(&self) -> &str {
        self.messages.last().map(|m| m.text.as_str()).unwrap_or("")
    }

    /// `author: text` lines in receipt order.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("{}: {}", m.author_id, m.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Flush triggers and the pending bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPolicy {
    pub char_threshold: Option<usize>,
    pub max_wait: Duration,
    pub count_threshold: Option<usize>,
    pub max_pending: usize,
}

impl BufferPolicy {
    pub fn responding(config: &SchedulerConfig) -> Self {
        Self {
            char_threshold: config.char_threshold,
            max_wait: config.max_wait(),
            count_threshold: config.count_threshold,
            max_pending: config.max_pending,
        }
    }

    /// Collector channels only flush on size or time.
    pub fn collecting(config: &CollectorConfig) -> Self {
        Self {
            char_threshold: config.char_threshold,
            max_wait: Duration::from_secs(config.max_wait_secs),
            count_threshold: None,
            max_pending: config.max_pending,
        }
    }
}

/// Snapshot of a buffer for logs and the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub pending: usize,
    pub accumulated_chars: usize,
    pub in_flight: bool,
    pub secs_since_last_flush: u64,
}

#[derive(Debug)]
struct State {
    pending: VecDeque<InboundMessage>,
    accumulated_chars: usize,
    last_flush_at: Instant,
    /// Ticket of the current holder of the single-flight slot.
    in_flight: Option<u64>,
    next_ticket: u64,
}

impl State {
    fn take_slot(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.in_flight = Some(ticket);
        ticket
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    // Bookkeeping never panics mid-update, so a poisoned lock still holds consistent state.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pending messages and the single-flight slot of one channel.
pub struct ChannelBuffer {
    state: Arc<Mutex<State>>,
    policy: BufferPolicy,
}

impl ChannelBuffer {
    pub fn new(policy: BufferPolicy) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                pending: VecDeque::new(),
                accumulated_chars: 0,
                last_flush_at: Instant::now(),
                in_flight: None,
                next_ticket: 0,
            })),
            policy,
        }
    }

    /// Append a message. Past `max_pending` the oldest unflushed message is evicted.
    pub fn enqueue(&self, message: InboundMessage) {
        let mut g = lock(&self.state);
        let cap = self.policy.max_pending.max(1);
        while g.pending.len() >= cap {
            let Some(evicted) = g.pending.pop_front() else {
                break;
            };
            g.accumulated_chars = g.accumulated_chars.saturating_sub(evicted.chars());
            log::debug!(
                "buffer: channel {} full, evicted message {}",
                evicted.channel_id,
                evicted.sequence_id
            );
        }
        g.accumulated_chars += message.chars();
        g.pending.push_back(message);
    }

    fn should_flush(&self, g: &State) -> bool {
        if g.pending.is_empty() || g.in_flight.is_some() {
            return false;
        }
        let by_chars = self
            .policy
            .char_threshold
            .is_some_and(|t| g.accumulated_chars >= t);
        let by_count = self
            .policy
            .count_threshold
            .is_some_and(|t| g.pending.len() >= t);
        let by_time = g.last_flush_at.elapsed() >= self.policy.max_wait;
        by_chars || by_count || by_time
    }

    /// Take every pending message as one batch when a trigger holds and nothing is in flight.
    pub fn try_flush(&self) -> Option<InFlight> {
        let mut g = lock(&self.state);
        if !self.should_flush(&g) {
            return None;
        }
        let messages: Vec<InboundMessage> = g.pending.drain(..).collect();
        g.accumulated_chars = 0;
        g.last_flush_at = Instant::now();
        let ticket = g.take_slot();
        Some(InFlight {
            state: self.state.clone(),
            ticket,
            batch: Some(Batch { messages }),
        })
    }

    /// Take the single-flight slot without flushing. None while a flush or another run holds it.
    pub fn try_acquire(&self) -> Option<InFlight> {
        let mut g = lock(&self.state);
        if g.in_flight.is_some() {
            return None;
        }
        let ticket = g.take_slot();
        Some(InFlight {
            state: self.state.clone(),
            ticket,
            batch: None,
        })
    }

    /// Clear the in-flight mark. Idempotent.
    pub fn release(&self) {
        lock(&self.state).in_flight = None;
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.state).in_flight.is_some()
    }

    pub fn stats(&self) -> BufferStats {
        let g = lock(&self.state);
        BufferStats {
            pending: g.pending.len(),
            accumulated_chars: g.accumulated_chars,
            in_flight: g.in_flight.is_some(),
            secs_since_last_flush: g.last_flush_at.elapsed().as_secs(),
        }
    }
}

/// Holds a channel's single-flight slot; releases it when dropped, including during unwinding.
///
/// A guard whose slot was already cleared by `ChannelBuffer::release` leaves later holders alone.
#[derive(Debug)]
pub struct InFlight {
    state: Arc<Mutex<State>>,
    ticket: u64,
    batch: Option<Batch>,
}

impl InFlight {
    pub fn batch(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }

    /// Move the batch out; the slot stays held until the guard drops.
    pub fn take_batch(&mut self) -> Option<Batch> {
        self.batch.take()
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut g = lock(&self.state);
        if g.in_flight == Some(self.ticket) {
            g.in_flight = None;
        }
    }
}
