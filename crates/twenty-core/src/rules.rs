//! Round configuration and audience rules

use crate::error::{GameError, Result};
use serde::{Deserialize, Serialize};

/// Guessers required before invitations go out and before play starts
pub const MIN_GUESSERS: usize = 3;

/// Immutable per-round limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundConfig {
    pub max_questions: u32,
    pub max_guesses_per_player: u32,
}

impl RoundConfig {
    /// Create a config, rejecting zero limits
    pub fn new(max_questions: u32, max_guesses_per_player: u32) -> Result<Self> {
        if max_questions == 0 {
            return Err(GameError::ConfigError("max_questions must be positive".into()));
        }
        if max_guesses_per_player == 0 {
            return Err(GameError::ConfigError(
                "max_guesses_per_player must be positive".into(),
            ));
        }
        Ok(Self {
            max_questions,
            max_guesses_per_player,
        })
    }
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            max_questions: 20,
            max_guesses_per_player: 3,
        }
    }
}

/// Content rules carried in the invitation.
///
/// Opaque to the coordinator; the thinker folds them into its object prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rules {
    pub target_audience: String,
    pub principle: String,
    pub requirement: String,
    pub language: String,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            target_audience: "children".into(),
            principle: "Choose objects from daily life that every child would recognize".into(),
            requirement: "Any object familiar to children - be creative and varied!".into(),
            language: "The game will be played in English - objects, questions, and answers \
                       should all be in English"
                .into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_limits_rejected() {
        assert!(RoundConfig::new(0, 3).is_err());
        assert!(RoundConfig::new(20, 0).is_err());
        assert_eq!(RoundConfig::new(5, 1).unwrap().max_questions, 5);
    }

    #[test]
    fn test_defaults() {
        let config = RoundConfig::default();
        assert_eq!(config.max_questions, 20);
        assert_eq!(config.max_guesses_per_player, 3);
        assert_eq!(Rules::default().target_audience, "children");
    }
}
