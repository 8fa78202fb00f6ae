//! Per-round game state
//!
//! `GameState` is owned by the coordinator and mutated only on its receive
//! loop. Everything other agents see is derived from it and serialized into
//! broadcasts.

use crate::player::PlayerId;
use crate::rules::{MIN_GUESSERS, RoundConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Transcript entry, in causal order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    Question {
        #[serde(alias = "turn")]
        turn_number: u32,
        guesser: PlayerId,
        question: String,
        answer: String,
    },
    Guess {
        guesser: PlayerId,
        guess: String,
        correct: bool,
    },
}

impl LogEntry {
    pub fn guesser(&self) -> &PlayerId {
        match self {
            LogEntry::Question { guesser, .. } | LogEntry::Guess { guesser, .. } => guesser,
        }
    }
}

/// Outcome of trying to record a guess result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuessRecord {
    Recorded,
    /// Player had already used every guess; nothing was written
    OverCap,
}

/// Authoritative record of one round
#[derive(Debug, Clone)]
pub struct GameState {
    config: RoundConfig,
    questions_asked: u32,
    player_guess_counts: BTreeMap<PlayerId, u32>,
    turn_index: u64,
    active: bool,
    thinker: Option<PlayerId>,
    thinker_ready: bool,
    guessers: Vec<PlayerId>,
    guessers_ready: BTreeSet<PlayerId>,
    transcript: Vec<LogEntry>,
}

impl GameState {
    pub fn new(config: RoundConfig) -> Self {
        Self {
            config,
            questions_asked: 0,
            player_guess_counts: BTreeMap::new(),
            turn_index: 0,
            active: false,
            thinker: None,
            thinker_ready: false,
            guessers: Vec::new(),
            guessers_ready: BTreeSet::new(),
            transcript: Vec::new(),
        }
    }

    /// Fresh state for the next round.
    ///
    /// Only the roster survives: thinker identity and guesser order. Play
    /// state (transcript, counters, readiness, turn index) starts over.
    pub fn for_next_round(&self) -> Self {
        Self {
            thinker: self.thinker.clone(),
            guessers: self.guessers.clone(),
            ..Self::new(self.config)
        }
    }

    pub fn config(&self) -> RoundConfig {
        self.config
    }

    // ---- roster ----

    /// Returns false if the thinker was already registered under this name
    pub fn register_thinker(&mut self, id: PlayerId) -> bool {
        let changed = self.thinker.as_ref() != Some(&id);
        self.thinker = Some(id);
        changed
    }

    /// Append a guesser in arrival order; duplicates are ignored
    pub fn register_guesser(&mut self, id: PlayerId) -> bool {
        if self.guessers.contains(&id) {
            return false;
        }
        self.guessers.push(id);
        true
    }

    pub fn thinker(&self) -> Option<&PlayerId> {
        self.thinker.as_ref()
    }

    pub fn thinker_registered(&self) -> bool {
        self.thinker.is_some()
    }

    pub fn guessers(&self) -> &[PlayerId] {
        &self.guessers
    }

    pub fn is_guesser(&self, id: &PlayerId) -> bool {
        self.guessers.contains(id)
    }

    /// Thinker plus enough guessers to send invitations
    pub fn roster_complete(&self) -> bool {
        self.thinker_registered() && self.guessers.len() >= MIN_GUESSERS
    }

    // ---- readiness ----

    pub fn mark_thinker_ready(&mut self) {
        self.thinker_ready = true;
    }

    pub fn mark_guesser_ready(&mut self, id: PlayerId) -> bool {
        self.guessers_ready.insert(id)
    }

    pub fn thinker_ready(&self) -> bool {
        self.thinker_ready
    }

    pub fn ready_guessers(&self) -> usize {
        self.guessers_ready.len()
    }

    pub fn all_ready(&self) -> bool {
        self.thinker_ready && self.guessers_ready.len() >= MIN_GUESSERS
    }

    // ---- play ----

    pub fn start(&mut self) {
        self.active = true;
    }

    pub fn finish(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn turn_index(&self) -> u64 {
        self.turn_index
    }

    /// Guesser whose turn it is; `None` only for an empty roster
    pub fn current_guesser(&self) -> Option<&PlayerId> {
        if self.guessers.is_empty() {
            return None;
        }
        let slot = (self.turn_index % self.guessers.len() as u64) as usize;
        self.guessers.get(slot)
    }

    pub fn advance_turn(&mut self) {
        self.turn_index += 1;
    }

    /// Append a question entry and return its turn number
    pub fn record_question(&mut self, guesser: PlayerId, question: String, answer: String) -> u32 {
        self.questions_asked += 1;
        self.transcript.push(LogEntry::Question {
            turn_number: self.questions_asked,
            guesser,
            question,
            answer,
        });
        self.questions_asked
    }

    /// Append a guess entry unless the player is already at the cap
    pub fn record_guess(&mut self, guesser: PlayerId, guess: String, correct: bool) -> GuessRecord {
        if !self.can_guess(&guesser) {
            return GuessRecord::OverCap;
        }
        *self.player_guess_counts.entry(guesser.clone()).or_insert(0) += 1;
        self.transcript.push(LogEntry::Guess {
            guesser,
            guess,
            correct,
        });
        GuessRecord::Recorded
    }

    pub fn can_guess(&self, id: &PlayerId) -> bool {
        self.guesses_used(id) < self.config.max_guesses_per_player
    }

    pub fn guesses_used(&self, id: &PlayerId) -> u32 {
        self.player_guess_counts.get(id).copied().unwrap_or(0)
    }

    pub fn player_guess_counts(&self) -> &BTreeMap<PlayerId, u32> {
        &self.player_guess_counts
    }

    pub fn total_guesses(&self) -> u32 {
        self.player_guess_counts.values().sum()
    }

    pub fn questions_asked(&self) -> u32 {
        self.questions_asked
    }

    pub fn questions_remaining(&self) -> u32 {
        self.config.max_questions.saturating_sub(self.questions_asked)
    }

    pub fn transcript(&self) -> &[LogEntry] {
        &self.transcript
    }

    /// Last `n` transcript entries
    pub fn recent_log(&self, n: usize) -> &[LogEntry] {
        let start = self.transcript.len().saturating_sub(n);
        &self.transcript[start..]
    }

    /// The guess that won the round, if any
    pub fn winning_guess(&self) -> Option<(&PlayerId, &str)> {
        self.transcript.iter().find_map(|entry| match entry {
            LogEntry::Guess {
                guesser,
                guess,
                correct: true,
            } => Some((guesser, guess.as_str())),
            _ => None,
        })
    }

    /// Every player who guessed has used all guesses
    pub fn guesses_exhausted(&self) -> bool {
        !self.player_guess_counts.is_empty()
            && self
                .player_guess_counts
                .values()
                .all(|&used| used >= self.config.max_guesses_per_player)
    }

    pub fn is_game_over(&self) -> bool {
        self.winning_guess().is_some()
            || self.questions_asked >= self.config.max_questions
            || self.guesses_exhausted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(config: RoundConfig) -> GameState {
        let mut state = GameState::new(config);
        state.register_thinker(PlayerId::parse("Alice"));
        for name in ["Bob", "Carol", "Dave"] {
            state.register_guesser(PlayerId::parse(name));
        }
        state
    }

    #[test]
    fn test_round_robin_selection() {
        let mut state = roster(RoundConfig::default());
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(state.current_guesser().unwrap().to_string());
            state.advance_turn();
        }
        assert_eq!(seen, ["Bob", "Carol", "Dave", "Bob", "Carol", "Dave", "Bob"]);
    }

    #[test]
    fn test_empty_roster_has_no_current_guesser() {
        let state = GameState::new(RoundConfig::default());
        assert!(state.current_guesser().is_none());
    }

    #[test]
    fn test_duplicate_registration_keeps_order() {
        let mut state = roster(RoundConfig::default());
        assert!(!state.register_guesser(PlayerId::parse("guesser-Bob")));
        assert!(state.register_guesser(PlayerId::parse("Erin")));
        let names: Vec<_> = state.guessers().iter().map(|g| g.as_str()).collect();
        assert_eq!(names, ["Bob", "Carol", "Dave", "Erin"]);
    }

    #[test]
    fn test_question_counter_matches_transcript() {
        let mut state = roster(RoundConfig::new(2, 3).unwrap());
        assert_eq!(state.record_question("Bob".into(), "Is it alive?".into(), "no".into()), 1);
        assert!(!state.is_game_over());
        assert_eq!(state.record_question("Carol".into(), "Is it red?".into(), "yes".into()), 2);
        let questions = state
            .transcript()
            .iter()
            .filter(|e| matches!(e, LogEntry::Question { .. }))
            .count();
        assert_eq!(questions as u32, state.questions_asked());
        assert!(state.is_game_over());
        assert_eq!(state.questions_remaining(), 0);
    }

    #[test]
    fn test_correct_guess_is_terminal() {
        let mut state = roster(RoundConfig::default());
        state.record_guess("Dave".into(), "apple".into(), true);
        assert!(state.is_game_over());
        assert_eq!(state.winning_guess().map(|(g, _)| g.as_str()), Some("Dave"));
    }

    #[test]
    fn test_guess_cap_enforced_at_record_time() {
        let mut state = roster(RoundConfig::new(20, 2).unwrap());
        let bob = PlayerId::parse("Bob");
        assert_eq!(state.record_guess(bob.clone(), "cat".into(), false), GuessRecord::Recorded);
        assert_eq!(state.record_guess(bob.clone(), "dog".into(), false), GuessRecord::Recorded);
        assert_eq!(state.record_guess(bob.clone(), "cow".into(), false), GuessRecord::OverCap);
        assert_eq!(state.guesses_used(&bob), 2);
        assert_eq!(state.transcript().len(), 2);
    }

    #[test]
    fn test_exhaustion_counts_only_players_who_guessed() {
        let mut state = roster(RoundConfig::new(20, 1).unwrap());
        assert!(!state.guesses_exhausted());
        state.record_guess("Bob".into(), "cat".into(), false);
        // Carol and Dave never guessed, but everyone who did is out
        assert!(state.guesses_exhausted());
        assert!(state.is_game_over());
    }

    #[test]
    fn test_next_round_keeps_roster_only() {
        let mut state = roster(RoundConfig::default());
        state.mark_thinker_ready();
        state.mark_guesser_ready("Bob".into());
        state.start();
        state.record_question("Bob".into(), "Is it big?".into(), "no".into());
        state.record_guess("Carol".into(), "ant".into(), false);
        state.advance_turn();

        let next = state.for_next_round();
        assert_eq!(next.guessers(), state.guessers());
        assert_eq!(next.thinker(), state.thinker());
        assert!(next.roster_complete());
        assert!(!next.is_active());
        assert!(!next.thinker_ready());
        assert_eq!(next.ready_guessers(), 0);
        assert_eq!(next.questions_asked(), 0);
        assert_eq!(next.turn_index(), 0);
        assert!(next.transcript().is_empty());
        assert!(next.player_guess_counts().is_empty());
    }

    #[test]
    fn test_log_entry_wire_shape() {
        let entry = LogEntry::Question {
            turn_number: 3,
            guesser: "Bob".into(),
            question: "Is it round?".into(),
            answer: "yes".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "question");
        assert_eq!(json["turn_number"], 3);

        // Older producers used `turn`
        let legacy = r#"{"type":"question","turn":4,"guesser":"guesser-Carol","question":"q","answer":"no"}"#;
        match serde_json::from_str::<LogEntry>(legacy).unwrap() {
            LogEntry::Question {
                turn_number,
                guesser,
                ..
            } => {
                assert_eq!(turn_number, 4);
                assert_eq!(guesser.as_str(), "Carol");
            }
            other => panic!("Wrong entry: {:?}", other),
        }
    }
}
