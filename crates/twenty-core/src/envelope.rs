//! Envelope wire format
//!
//! Every message travels as JSON:
//! `{"type": "<tag>", "timestamp": "<RFC 3339>", "data": {...}}`
//!
//! `Message` is adjacently tagged so `type`/`data` fall out of serde; the
//! timestamp is stitched in by `Envelope::encode` and read back leniently.

use crate::error::{GameError, Result};
use crate::player::{PlayerId, Role};
use crate::rules::Rules;
use crate::state::LogEntry;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Result of the thinker checking a guess
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuessOutcome {
    pub guesser: PlayerId,
    pub guess: String,
    pub correct: bool,
    /// Only present when `correct` is true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_object: Option<String>,
}

impl GuessOutcome {
    /// Build an outcome that reveals the object only on a correct guess
    pub fn new(guesser: PlayerId, guess: String, correct: bool, object: &str) -> Self {
        Self {
            guesser,
            guess,
            correct,
            actual_object: correct.then(|| object.to_string()),
        }
    }
}

/// Turn announcement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnNotice {
    pub guesser: PlayerId,
    pub questions_remaining: u32,
    #[serde(default)]
    pub player_guesses: BTreeMap<PlayerId, u32>,
    pub max_guesses_per_player: u32,
    /// Most recent transcript entries
    #[serde(default)]
    pub game_log: Vec<LogEntry>,
}

impl TurnNotice {
    /// Guesses `player` may still make this round
    pub fn guesses_left(&self, player: &PlayerId) -> u32 {
        let used = self.player_guesses.get(player).copied().unwrap_or(0);
        self.max_guesses_per_player.saturating_sub(used)
    }
}

/// Final round summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameSummary {
    pub winner: Option<PlayerId>,
    pub result: String,
    pub questions_asked: u32,
    pub total_guesses_made: u32,
    #[serde(default)]
    pub player_guesses: BTreeMap<PlayerId, u32>,
    #[serde(default)]
    pub game_log: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_object: Option<String>,
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    // === Players -> coordinator ===
    AgentReady {
        role: Role,
        name: PlayerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strategy: Option<String>,
    },
    GameReady {
        role: Role,
        name: PlayerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        object_chosen: Option<bool>,
    },
    Question {
        question: String,
    },
    Answer {
        question: String,
        answer: String,
        guesser: PlayerId,
    },
    Guess {
        guess: String,
    },
    /// Sent by the thinker and re-broadcast by the coordinator
    GuessResult(GuessOutcome),

    // === Coordinator broadcasts ===
    GameInvitation {
        max_questions: u32,
        max_guesses_per_player: u32,
        rules: Rules,
    },
    GameStart {
        thinker: Option<PlayerId>,
        guessers: Vec<PlayerId>,
        max_questions: u32,
        max_guesses_per_player: u32,
    },
    YourTurn(TurnNotice),
    QuestionForThinker {
        guesser: PlayerId,
        question: String,
    },
    AnswerFromThinker {
        guesser: PlayerId,
        question: String,
        answer: String,
        turn_number: u32,
    },
    GuessForThinker {
        guesser: PlayerId,
        guess: String,
    },
    GameOver(GameSummary),

    // === Private channel ===
    SecretObject {
        object: String,
    },
}

impl Message {
    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AgentReady { .. } => "agent_ready",
            Message::GameReady { .. } => "game_ready",
            Message::Question { .. } => "question",
            Message::Answer { .. } => "answer",
            Message::Guess { .. } => "guess",
            Message::GuessResult(_) => "guess_result",
            Message::GameInvitation { .. } => "game_invitation",
            Message::GameStart { .. } => "game_start",
            Message::YourTurn(_) => "your_turn",
            Message::QuestionForThinker { .. } => "question_for_thinker",
            Message::AnswerFromThinker { .. } => "answer_from_thinker",
            Message::GuessForThinker { .. } => "guess_for_thinker",
            Message::GameOver(_) => "game_over",
            Message::SecretObject { .. } => "secret_object",
        }
    }
}

/// Timestamped message as carried over a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    pub message: Message,
}

impl Envelope {
    /// Stamp a message with the current time
    pub fn new(message: Message) -> Self {
        Self {
            timestamp: Utc::now(),
            message,
        }
    }

    /// Serialize to JSON bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(&self.message)?;
        match value.as_object_mut() {
            Some(map) => {
                map.insert(
                    "timestamp".into(),
                    serde_json::Value::String(self.timestamp.to_rfc3339()),
                );
            }
            None => {
                return Err(GameError::SerializationError(format!(
                    "{} did not serialize to an object",
                    self.message.kind()
                )));
            }
        }
        Ok(serde_json::to_vec(&value)?)
    }

    /// Parse JSON bytes. A missing or unparsable timestamp is replaced with now.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| GameError::MalformedEnvelope(e.to_string()))?;

        let timestamp = value
            .get("timestamp")
            .and_then(|t| t.as_str())
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let message: Message = serde_json::from_value(value)
            .map_err(|e| GameError::MalformedEnvelope(e.to_string()))?;

        Ok(Self { timestamp, message })
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        // Naive ISO-8601 without offset, treated as UTC
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

/// Hex SHA-256 of a raw payload, used to recognise re-deliveries
pub fn payload_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
