//! # twenty-agents
//!
//! Role protocols for the Twenty Questions game.
//!
//! This crate provides:
//! - `Coordinator`: referee owning the round state and turn order
//! - `Thinker`: keeper of the secret object
//! - `Guesser`: turn-taking player with background reasoning
//! - `Translator`: observer rendering broadcasts in another language
//! - `Reasoner` trait and an OpenAI-compatible implementation
//!
//! Every agent is generic over the messaging `Endpoint`, so the same code
//! runs over the in-process hub and over the TCP relay.

pub mod coordinator;
pub mod guesser;
pub mod prompts;
pub mod reasoning;
pub mod session;
pub mod thinker;
pub mod translator;

#[cfg(test)]
mod testing;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorProtocol, Directive, Phase};
pub use guesser::{Guesser, GuesserConfig, Strategy};
pub use reasoning::{OpenAiCompatible, Prompt, Reasoner, ReasonerConfig};
pub use thinker::{Thinker, ThinkerConfig};
pub use translator::{Translator, TranslatorConfig};
