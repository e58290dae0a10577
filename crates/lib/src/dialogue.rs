//! Bounded two-persona dialogue.
//!
//! One `run` is one back-and-forth: the active persona generates, the turn is counted, and the
//! dialogue either ends or hands over to the other persona. A reactive run answers a batch and
//! stops once the last responder has spoken (at most two utterances); an autonomous run riffs on
//! a topic until `max_depth` turns. Any generation failure, timeout or empty reply ends the run
//! early with whatever was produced so far.

use crate::buffer::Batch;
use crate::config::{PersonaConfig, PersonaSlot, SchedulerConfig};
use crate::llm::{ChatMessage, LlmError, LlmGateway};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    A,
    B,
}

impl Persona {
    pub fn other(self) -> Self {
        match self {
            Persona::A => Persona::B,
            Persona::B => Persona::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Persona::A => "a",
            Persona::B => "b",
        }
    }
}

impl From<PersonaSlot> for Persona {
    fn from(slot: PersonaSlot) -> Self {
        match slot {
            PersonaSlot::A => Persona::A,
            PersonaSlot::B => Persona::B,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Answering a batch of human messages.
    Reactive,
    /// Self-driven dialogue on a topic.
    Autonomous,
}

/// What an utterance answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespondsTo {
    Batch { first_sequence: u64, last_sequence: u64 },
    Topic(String),
    /// Index into the run's output.
    Utterance(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub text: String,
    pub persona: Persona,
    pub produced_at: DateTime<Utc>,
    pub responds_to: RespondsTo,
}

/// What starts a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seed {
    Batch {
        transcript: String,
        first_sequence: u64,
        last_sequence: u64,
        /// Recalled memory texts shown alongside the transcript.
        context: Vec<String>,
    },
    Topic(String),
}

impl Seed {
    pub fn from_batch(batch: &Batch, context: Vec<String>) -> Self {
        Seed::Batch {
            transcript: batch.transcript(),
            first_sequence: batch.first_sequence(),
            last_sequence: batch.last_sequence(),
            context,
        }
    }

    fn prompt(&self) -> String {
        match self {
            Seed::Batch {
                transcript,
                context,
                ..
            } => {
                if context.is_empty() {
                    format!("Recent messages in the chat:\n{}", transcript)
                } else {
                    let recalled: Vec<String> = context.iter().map(|c| format!("- {}", c)).collect();
                    format!(
                        "Things said here before:\n{}\n\nRecent messages in the chat:\n{}",
                        recalled.join("\n"),
                        transcript
                    )
                }
            }
            Seed::Topic(topic) => format!("Share a thought about: {}", topic),
        }
    }

    fn responds_to(&self) -> RespondsTo {
        match self {
            Seed::Batch {
                first_sequence,
                last_sequence,
                ..
            } => RespondsTo::Batch {
                first_sequence: *first_sequence,
                last_sequence: *last_sequence,
            },
            Seed::Topic(topic) => RespondsTo::Topic(topic.clone()),
        }
    }
}

/// A persona's instructions plus the gateway that voices it.
#[derive(Clone)]
pub struct Voice {
    pub name: String,
    pub system_prompt: String,
    pub follow_up: String,
    pub gateway: Arc<dyn LlmGateway>,
}

impl Voice {
    pub fn new(config: &PersonaConfig, gateway: Arc<dyn LlmGateway>) -> Self {
        Self {
            name: config.name.clone(),
            system_prompt: config.system_prompt.clone(),
            follow_up: config.follow_up.clone(),
            gateway,
        }
    }
}

/// Bounds for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialogueLimits {
    pub max_depth: usize,
    pub history_window: usize,
    pub generation_timeout: Duration,
}

impl DialogueLimits {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_depth: config.max_dialogue_depth,
            history_window: config.history_window,
            generation_timeout: config.generation_timeout(),
        }
    }
}

struct DialogueState {
    history: Vec<Utterance>,
    active: Persona,
    turn_count: usize,
    mode: Mode,
}

pub struct DialogueEngine {
    a: Voice,
    b: Voice,
    first_responder: Persona,
    limits: DialogueLimits,
}

impl DialogueEngine {
    pub fn new(a: Voice, b: Voice, first_responder: Persona, limits: DialogueLimits) -> Self {
        Self {
            a,
            b,
            first_responder,
            limits,
        }
    }

    fn voice(&self, persona: Persona) -> &Voice {
        match persona {
            Persona::A => &self.a,
            Persona::B => &self.b,
        }
    }

    /// Run one dialogue. Never fails; returns utterances in production order, possibly none.
    pub async fn run(&self, mode: Mode, seed: &Seed) -> Vec<Utterance> {
        let start = match mode {
            Mode::Reactive => self.first_responder,
            Mode::Autonomous => {
                if rand::random::<bool>() {
                    Persona::A
                } else {
                    Persona::B
                }
            }
        };
        self.run_from(mode, seed, start).await
    }

    /// Single generation by the first responder.
    pub async fn reply_direct(&self, seed: &Seed) -> Option<Utterance> {
        let persona = self.first_responder;
        let messages = self.messages(persona, &[], Some(seed));
        match self.generate(persona, &messages).await {
            Ok(text) => Some(Utterance {
                text,
                persona,
                produced_at: Utc::now(),
                responds_to: seed.responds_to(),
            }),
            Err(e) => {
                log::warn!("dialogue: direct reply by {} failed: {}", self.voice(persona).name, e);
                None
            }
        }
    }

    pub(crate) async fn run_from(&self, mode: Mode, seed: &Seed, start: Persona) -> Vec<Utterance> {
        let last_responder = self.first_responder.other();
        let mut state = DialogueState {
            history: Vec::new(),
            active: start,
            turn_count: 0,
            mode,
        };
        while state.turn_count < self.limits.max_depth {
            let speaker = state.active;
            let seed_for_turn = state.history.is_empty().then_some(seed);
            let messages = self.messages(speaker, &state.history, seed_for_turn);
            let text = match self.generate(speaker, &messages).await {
                Ok(text) => text,
                Err(e) => {
                    log::warn!(
                        "dialogue: {} failed on turn {}: {}",
                        self.voice(speaker).name,
                        state.turn_count + 1,
                        e
                    );
                    break;
                }
            };
            let responds_to = match state.history.len() {
                0 => seed.responds_to(),
                n => RespondsTo::Utterance(n - 1),
            };
            state.history.push(Utterance {
                text,
                persona: speaker,
                produced_at: Utc::now(),
                responds_to,
            });
            state.turn_count += 1;
            if state.mode == Mode::Reactive && speaker == last_responder {
                break;
            }
            state.active = speaker.other();
        }
        log::debug!(
            "dialogue: {:?} run finished after {} turn(s)",
            state.mode,
            state.turn_count
        );
        state.history
    }

    /// System prompt, the recent window of history from the speaker's point of view, then the
    /// seed on the first turn or the persona's follow-up prompt afterwards.
    fn messages(&self, speaker: Persona, history: &[Utterance], seed: Option<&Seed>) -> Vec<ChatMessage> {
        let voice = self.voice(speaker);
        let mut messages = vec![ChatMessage::system(voice.system_prompt.clone())];
        let skip = history.len().saturating_sub(self.limits.history_window);
        for u in &history[skip..] {
            if u.persona == speaker {
                messages.push(ChatMessage::assistant(u.text.clone()));
            } else {
                messages.push(ChatMessage::user(u.text.clone()));
            }
        }
        match seed {
            Some(seed) => messages.push(ChatMessage::user(seed.prompt())),
            None => messages.push(ChatMessage::user(voice.follow_up.clone())),
        }
        messages
    }

    async fn generate(&self, persona: Persona, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let timeout = self.limits.generation_timeout;
        let reply = tokio::time::timeout(timeout, self.voice(persona).gateway.generate(messages))
            .await
            .map_err(|_| LlmError::Timeout(timeout))??;
        let text = reply.trim();
        if text.is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(text.to_string())
    }
}
