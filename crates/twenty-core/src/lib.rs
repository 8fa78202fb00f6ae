//! # twenty-core
//!
//! Core types for the Twenty Questions agent protocol.
//!
//! This crate provides the foundational types shared by every agent:
//! - Player identity and roles
//! - Round configuration and audience rules
//! - Per-round game state and transcript
//! - Envelope wire format

pub mod envelope;
pub mod error;
pub mod player;
pub mod rules;
pub mod state;

pub use envelope::{Envelope, GameSummary, GuessOutcome, Message, TurnNotice, payload_digest};
pub use error::{GameError, Result};
pub use player::{COORDINATOR_PEER, PlayerId, Role};
pub use rules::{MIN_GUESSERS, RoundConfig, Rules};
pub use state::{GameState, GuessRecord, LogEntry};
