//! Scripted collaborators shared by unit tests.

use crate::channels::ChannelHandle;
use crate::llm::{ChatMessage, LlmError, LlmGateway};
use crate::memory::{MemoryEntry, MemoryError, MemoryStore};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub enum Step {
    Reply(String),
    Fail,
    Empty,
    Hang,
    Panic,
}

/// Gateway that plays back a script; once the script runs out it repeats `fallback`.
pub struct ScriptedGateway {
    name: String,
    script: Mutex<VecDeque<Step>>,
    fallback: fn(&str, usize) -> Step,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGateway {
    pub fn new(name: &str, script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            fallback: |name, n| Step::Reply(format!("{} says #{}", name, n)),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Always replies "<name> says #<call>".
    pub fn chatty(name: &str) -> Arc<Self> {
        Self::new(name, Vec::new())
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: |_, _| Step::Fail,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn panicking(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: |_, _| Step::Panic,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen.lock().unwrap().push(messages.to_vec());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| (self.fallback)(&self.name, n));
        match step {
            Step::Reply(text) => Ok(text),
            Step::Fail => Err(LlmError::Api("scripted failure".to_string())),
            Step::Empty => Ok("   ".to_string()),
            Step::Hang => std::future::pending().await,
            Step::Panic => panic!("scripted panic from {}", self.name),
        }
    }
}

/// Channel that records deliveries and can be told to fail them.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let c = Self::default();
        c.fail.store(true, Ordering::SeqCst);
        Arc::new(c)
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelHandle for RecordingChannel {
    fn id(&self) -> &str {
        "recording"
    }

    fn stop(&self) {}

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<(), String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("delivery refused".to_string());
        }
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Store that records entries, returns canned recall results and can refuse writes.
#[derive(Default)]
pub struct RecordingStore {
    entries: Mutex<Vec<MemoryEntry>>,
    recall: Mutex<Vec<MemoryEntry>>,
    queries: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let s = Self::default();
        s.fail.store(true, Ordering::SeqCst);
        Arc::new(s)
    }

    pub fn with_recall(texts: &[&str]) -> Arc<Self> {
        let s = Self::default();
        *s.recall.lock().unwrap() = texts
            .iter()
            .map(|t| MemoryEntry::new(*t, "group_chat"))
            .collect();
        Arc::new(s)
    }

    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn sources(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.source).collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl MemoryStore for RecordingStore {
    async fn remember(&self, entry: MemoryEntry) -> Result<(), MemoryError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MemoryError::Unavailable("scripted outage".to_string()));
        }
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    async fn recall(&self, query: &str, top_k: usize) -> Vec<MemoryEntry> {
        self.queries.lock().unwrap().push(query.to_string());
        self.recall.lock().unwrap().iter().take(top_k).cloned().collect()
    }
}
