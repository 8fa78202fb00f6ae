//! Guesser
//!
//! The receive loop never waits on the reasoner. A `your_turn` for this
//! guesser spawns one turn task that decides, generates and publishes exactly
//! one `question` or `guess`; the loop keeps draining the channel meanwhile.

use crate::prompts::{self, Standing};
use crate::reasoning::{Prompt, Reasoner};
use crate::session::{from_coordinator, join_game, next_envelope, publish_retrying};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use twenty_bridge::{Channel, Endpoint};
use twenty_core::{
    GameError, GameSummary, LogEntry, Message, PlayerId, Result, Role, RoundConfig, TurnNotice,
};

/// Asked when the reasoner cannot produce a question in time
pub const FALLBACK_QUESTION: &str = "Is it something you can find at home?";
/// Guessed when the reasoner cannot produce a guess in time
pub const FALLBACK_GUESS: &str = "ball";

/// Once this few questions remain, a guesser with guesses left always guesses
const LATE_GAME_QUESTIONS: u32 = 2;

/// Questioning personality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    Random,
    Systematic,
    Creative,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Random => "random",
            Strategy::Systematic => "systematic",
            Strategy::Creative => "creative",
        }
    }

    /// Label reported in `agent_ready`
    pub fn label(&self) -> String {
        format!("LLM-{}", self.as_str())
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Strategy::Random),
            "systematic" => Ok(Strategy::Systematic),
            "creative" => Ok(Strategy::Creative),
            other => Err(GameError::ConfigError(format!(
                "unknown strategy '{}' (expected random, systematic or creative)",
                other
            ))),
        }
    }
}

/// Guesser configuration
#[derive(Debug, Clone)]
pub struct GuesserConfig {
    /// Display name, e.g. `Bob`
    pub name: String,
    pub strategy: Strategy,
    pub game_channel: String,
    pub poll_timeout: Duration,
    pub retry_delay: Duration,
    /// Bound on the GUESS-or-QUESTION decision
    pub decision_timeout: Duration,
    /// Bound on generating the question or guess itself
    pub generation_timeout: Duration,
}

impl Default for GuesserConfig {
    fn default() -> Self {
        Self {
            name: "Bob".into(),
            strategy: Strategy::Random,
            game_channel: "classroom/game".into(),
            poll_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            decision_timeout: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Move {
    Ask,
    Guess,
}

/// Clears the in-progress marker when the turn task ends, however it ends.
/// A newer turn owns the marker once it has been re-set, so only a matching
/// id is cleared.
struct TurnGuard {
    id: u64,
    active: Arc<AtomicU64>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let _ = self
            .active
            .compare_exchange(self.id, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Everything a turn task needs, detached from the agent
struct Turn<R: Reasoner> {
    reasoner: Arc<R>,
    me: PlayerId,
    strategy: Strategy,
    max_questions: u32,
    decision_timeout: Duration,
    generation_timeout: Duration,
}

impl<R: Reasoner> Turn<R> {
    async fn play(&self, notice: &TurnNotice, memory: &[LogEntry]) -> Message {
        let standing = Standing {
            questions_asked: self.max_questions.saturating_sub(notice.questions_remaining),
            max_questions: self.max_questions,
            guesses_used: notice.player_guesses.get(&self.me).copied().unwrap_or(0),
            max_guesses: notice.max_guesses_per_player,
        };

        match self.choose(notice, standing, memory).await {
            Move::Guess => {
                let prompt = prompts::make_guess(&self.me, self.strategy, standing, memory);
                let guess = self
                    .generate(&prompt, prompts::GUESS_TOKENS, "guess")
                    .await
                    .map(|text| clean_guess(&text))
                    .filter(|g| !g.is_empty())
                    .unwrap_or_else(|| FALLBACK_GUESS.to_string());
                info!("{} guesses '{}'", self.me, guess);
                Message::Guess { guess }
            }
            Move::Ask => {
                let prompt = prompts::ask_question(self.strategy, standing.max_guesses, memory);
                let question = self
                    .generate(&prompt, prompts::QUESTION_TOKENS, "question")
                    .await
                    .map(|text| clean_question(&text))
                    .filter(|q| q.len() > 1)
                    .unwrap_or_else(|| FALLBACK_QUESTION.to_string());
                info!("{} asks '{}'", self.me, question);
                Message::Question { question }
            }
        }
    }

    async fn choose(&self, notice: &TurnNotice, standing: Standing, memory: &[LogEntry]) -> Move {
        if notice.guesses_left(&self.me) == 0 {
            debug!("{} has no guesses left; asking", self.me);
            return Move::Ask;
        }
        if notice.questions_remaining <= LATE_GAME_QUESTIONS {
            debug!("Only {} questions remain; guessing", notice.questions_remaining);
            return Move::Guess;
        }

        let prompt = prompts::decide(&self.me, self.strategy, standing, memory);
        let reply = tokio::time::timeout(
            self.decision_timeout,
            self.reasoner.complete(&prompt, prompts::DECISION_TOKENS),
        )
        .await;
        match reply {
            Ok(Ok(text)) if text.trim().to_ascii_uppercase().starts_with("GUESS") => Move::Guess,
            Ok(Ok(_)) => Move::Ask,
            Ok(Err(e)) => {
                warn!("Decision failed for {}: {}; asking", self.me, e);
                Move::Ask
            }
            Err(_) => {
                warn!("Decision timed out for {}; asking", self.me);
                Move::Ask
            }
        }
    }

    async fn generate(&self, prompt: &Prompt, max_tokens: u32, what: &str) -> Option<String> {
        match tokio::time::timeout(
            self.generation_timeout,
            self.reasoner.complete(prompt, max_tokens),
        )
        .await
        {
            Ok(Ok(text)) => Some(text),
            Ok(Err(e)) => {
                warn!("Generating {} failed for {}: {}; using fallback", what, self.me, e);
                None
            }
            Err(_) => {
                warn!("Generating {} timed out for {}; using fallback", what, self.me);
                None
            }
        }
    }
}

fn strip_quotes(text: &str) -> &str {
    text.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '`').trim()
}

/// First line, unquoted, ending with a question mark
fn clean_question(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let line = line.strip_prefix("Question:").unwrap_or(line);
    let mut question = strip_quotes(line).to_string();
    if !question.is_empty() && !question.ends_with('?') {
        question.push('?');
    }
    question
}

/// First line, unquoted, without trailing punctuation
fn clean_guess(text: &str) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let line = line.strip_prefix("Guess:").unwrap_or(line);
    strip_quotes(line)
        .trim_end_matches(['.', '!', '?'])
        .trim()
        .to_string()
}

/// Guesser agent
pub struct Guesser<E: Endpoint, R: Reasoner> {
    endpoint: E,
    reasoner: Arc<R>,
    config: GuesserConfig,
    me: PlayerId,
    max_questions: u32,
    /// Public outcomes seen this round, oldest first
    memory: Vec<LogEntry>,
    turn: Option<JoinHandle<()>>,
    /// Id of the turn in flight, 0 when idle
    active_turn: Arc<AtomicU64>,
    turns_started: u64,
}

impl<E: Endpoint, R: Reasoner> Guesser<E, R> {
    pub fn new(endpoint: E, reasoner: Arc<R>, config: GuesserConfig) -> Self {
        let me = PlayerId::parse(&config.name);
        Self {
            endpoint,
            reasoner,
            config,
            me,
            max_questions: RoundConfig::default().max_questions,
            memory: Vec::new(),
            turn: None,
            active_turn: Arc::new(AtomicU64::new(0)),
            turns_started: 0,
        }
    }

    pub fn turn_in_progress(&self) -> bool {
        self.active_turn.load(Ordering::SeqCst) != 0
    }

    /// Join the game, play until `game_over`, and return its summary
    pub async fn run(&mut self) -> Result<GameSummary> {
        let channel = Arc::new(
            join_game(&self.endpoint, &self.config.game_channel, self.config.poll_timeout).await?,
        );
        publish_retrying(
            channel.as_ref(),
            Message::AgentReady {
                role: Role::Guesser,
                name: self.me.clone(),
                strategy: Some(self.config.strategy.label()),
            },
            self.config.retry_delay,
        )
        .await?;
        info!("Guesser {} registered ({} strategy)", self.me, self.config.strategy);

        loop {
            let Some((delivery, envelope)) = next_envelope(
                channel.as_ref(),
                self.config.poll_timeout,
                self.config.retry_delay,
            )
            .await?
            else {
                continue;
            };
            if !from_coordinator(&delivery.source) {
                continue;
            }
            if let Some(summary) = self.handle(envelope.message, &channel).await {
                return Ok(summary);
            }
        }
    }

    async fn handle(&mut self, message: Message, channel: &Arc<E::Channel>) -> Option<GameSummary> {
        match message {
            Message::GameInvitation { max_questions, .. } => {
                self.max_questions = max_questions;
                self.memory.clear();
                let ready = Message::GameReady {
                    role: Role::Guesser,
                    name: self.me.clone(),
                    object_chosen: None,
                };
                if let Err(e) =
                    publish_retrying(channel.as_ref(), ready, self.config.retry_delay).await
                {
                    error!("{} could not confirm readiness: {}", self.me, e);
                }
            }
            Message::GameStart { guessers, .. } => {
                info!(
                    "{} sees the game start with {:?}",
                    self.me,
                    guessers.iter().map(|g| g.as_str()).collect::<Vec<_>>()
                );
            }
            Message::YourTurn(notice) => {
                if notice.guesser == self.me {
                    self.start_turn(notice, channel.clone());
                } else {
                    debug!("{} waits; it is {}'s turn", self.me, notice.guesser);
                }
            }
            Message::AnswerFromThinker {
                guesser,
                question,
                answer,
                turn_number,
            } => {
                info!("Q{} {}: {} -> {}", turn_number, guesser, question, answer);
                self.memory.push(LogEntry::Question {
                    turn_number,
                    guesser,
                    question,
                    answer,
                });
            }
            Message::GuessResult(outcome) => {
                if outcome.correct {
                    info!("{} won with '{}'", outcome.guesser, outcome.guess);
                } else {
                    info!("{} guessed '{}' - wrong", outcome.guesser, outcome.guess);
                }
                self.memory.push(LogEntry::Guess {
                    guesser: outcome.guesser,
                    guess: outcome.guess,
                    correct: outcome.correct,
                });
            }
            Message::GameOver(summary) => {
                self.stop_turn();
                match &summary.winner {
                    Some(w) if *w == self.me => info!("{} won this round!", self.me),
                    Some(w) => info!("{} won this round", w),
                    None => info!("No one won this round"),
                }
                info!(
                    "Game over: {} (object: {})",
                    summary.result,
                    summary.actual_object.as_deref().unwrap_or("unknown")
                );
                return Some(summary);
            }
            other => debug!("{} ignores {}", self.me, other.kind()),
        }
        None
    }

    fn start_turn(&mut self, notice: TurnNotice, channel: Arc<E::Channel>) {
        if let Some(stale) = self.turn.take() {
            if !stale.is_finished() {
                warn!(
                    "{} got a new turn while the previous one was still running; abandoning it",
                    self.me
                );
                stale.abort();
            }
        }

        self.turns_started += 1;
        let id = self.turns_started;
        self.active_turn.store(id, Ordering::SeqCst);
        let guard = TurnGuard {
            id,
            active: self.active_turn.clone(),
        };

        let turn = Turn {
            reasoner: self.reasoner.clone(),
            me: self.me.clone(),
            strategy: self.config.strategy,
            max_questions: self.max_questions,
            decision_timeout: self.config.decision_timeout,
            generation_timeout: self.config.generation_timeout,
        };
        let memory = if self.memory.is_empty() {
            notice.game_log.clone()
        } else {
            self.memory.clone()
        };

        let retry = self.config.retry_delay;
        debug!(
            "{} starts turn {} ({} questions left)",
            self.me, id, notice.questions_remaining
        );
        self.turn = Some(tokio::spawn(async move {
            let _guard = guard;
            let message = turn.play(&notice, &memory).await;
            // Retried inside the task so a newer turn's abort also cancels it
            if let Err(e) = publish_retrying(channel.as_ref(), message, retry).await {
                error!("{} could not send its move: {}", turn.me, e);
            }
        }));
    }

    fn stop_turn(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.abort();
        }
    }
}

impl<E: Endpoint, R: Reasoner> Drop for Guesser<E, R> {
    fn drop(&mut self) {
        self.stop_turn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::publish;
    use crate::testing::{Faults, FlakyEndpoint, ScriptedReasoner, StalledReasoner};
    use std::collections::BTreeMap;
    use twenty_bridge::{Hub, LocalChannel};
    use twenty_core::{Envelope, GameSummary};

    const POLL: Duration = Duration::from_millis(20);

    fn config() -> GuesserConfig {
        GuesserConfig {
            name: "Bob".into(),
            game_channel: "game".into(),
            poll_timeout: POLL,
            retry_delay: POLL,
            decision_timeout: Duration::from_millis(100),
            generation_timeout: Duration::from_millis(100),
            ..GuesserConfig::default()
        }
    }

    fn notice(questions_remaining: u32, bob_guesses: u32) -> Message {
        let mut player_guesses = BTreeMap::new();
        if bob_guesses > 0 {
            player_guesses.insert(PlayerId::parse("Bob"), bob_guesses);
        }
        Message::YourTurn(TurnNotice {
            guesser: "guesser-Bob".into(),
            questions_remaining,
            player_guesses,
            max_guesses_per_player: 3,
            game_log: Vec::new(),
        })
    }

    fn game_over() -> Message {
        Message::GameOver(GameSummary {
            winner: None,
            result: "Time's up! No one guessed the object.".into(),
            questions_asked: 20,
            total_guesses_made: 0,
            player_guesses: BTreeMap::new(),
            game_log: Vec::new(),
            actual_object: None,
        })
    }

    async fn recv(channel: &LocalChannel, wait: Duration) -> Option<Message> {
        channel
            .receive(wait)
            .await
            .unwrap()
            .map(|d| Envelope::decode(&d.payload).unwrap().message)
    }

    /// Coordinator-side channel with a running guesser that has registered
    async fn seat<R: Reasoner>(
        reasoner: Arc<R>,
    ) -> (Hub, LocalChannel, JoinHandle<Result<GameSummary>>) {
        let hub = Hub::new();
        let coord = hub.connect("coordinator");
        let game = coord.create_channel("game").await.unwrap();
        game.invite("guesser-Bob").await.unwrap();

        let endpoint = hub.connect("guesser-Bob");
        let task = tokio::spawn(async move {
            let mut guesser = Guesser::new(endpoint, reasoner, config());
            guesser.run().await
        });

        match recv(&game, Duration::from_secs(1)).await {
            Some(Message::AgentReady { name, strategy, .. }) => {
                assert_eq!(name.as_str(), "Bob");
                assert_eq!(strategy.as_deref(), Some("LLM-random"));
            }
            other => panic!("Expected agent_ready, got {:?}", other),
        }
        (hub, game, task)
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("Systematic".parse::<Strategy>().unwrap(), Strategy::Systematic);
        assert_eq!("creative".parse::<Strategy>().unwrap(), Strategy::Creative);
        assert!("chaotic".parse::<Strategy>().is_err());
        assert_eq!(Strategy::default().label(), "LLM-random");
    }

    #[test]
    fn test_cleaning() {
        assert_eq!(clean_question("\"Is it alive\"\nmore"), "Is it alive?");
        assert_eq!(clean_question("Question: Can it fly?"), "Can it fly?");
        assert_eq!(clean_guess("'Kite'."), "Kite");
        assert_eq!(clean_guess("Guess: apple!"), "apple");
    }

    #[tokio::test]
    async fn test_invitation_answered_with_game_ready() {
        let (_hub, game, task) = seat(Arc::new(ScriptedReasoner::constant("QUESTION"))).await;
        publish(
            &game,
            Message::GameInvitation {
                max_questions: 20,
                max_guesses_per_player: 3,
                rules: Default::default(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            recv(&game, Duration::from_secs(1)).await,
            Some(Message::GameReady { role: Role::Guesser, .. })
        ));
        publish(&game, game_over()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stalled_reasoner_sends_one_fallback_question() {
        let reasoner = Arc::new(StalledReasoner::default());
        let (_hub, game, task) = seat(reasoner.clone()).await;

        publish(&game, notice(10, 0)).await.unwrap();
        match recv(&game, Duration::from_secs(2)).await {
            Some(Message::Question { question }) => assert_eq!(question, FALLBACK_QUESTION),
            other => panic!("Expected fallback question, got {:?}", other),
        }
        assert!(recv(&game, Duration::from_millis(300)).await.is_none());
        // Decision and question generation were both attempted
        assert_eq!(reasoner.calls(), 2);

        publish(&game, game_over()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_late_game_guesses_without_deciding() {
        let reasoner = Arc::new(ScriptedReasoner::constant("\"Kite\""));
        let (_hub, game, task) = seat(reasoner.clone()).await;

        publish(&game, notice(2, 0)).await.unwrap();
        match recv(&game, Duration::from_secs(1)).await {
            Some(Message::Guess { guess }) => assert_eq!(guess, "Kite"),
            other => panic!("Expected a guess, got {:?}", other),
        }
        assert_eq!(reasoner.prompts().len(), 1);

        publish(&game, game_over()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_guesses_left_asks() {
        let reasoner = Arc::new(ScriptedReasoner::constant("Is it bigger than a cat?"));
        let (_hub, game, task) = seat(reasoner).await;

        // Out of guesses wins over the late-game rule
        publish(&game, notice(1, 3)).await.unwrap();
        match recv(&game, Duration::from_secs(1)).await {
            Some(Message::Question { question }) => assert_eq!(question, "Is it bigger than a cat?"),
            other => panic!("Expected a question, got {:?}", other),
        }

        publish(&game, game_over()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_generation_falls_back_to_guess() {
        let reasoner = Arc::new(ScriptedReasoner::failing());
        let (_hub, game, task) = seat(reasoner).await;

        publish(&game, notice(1, 0)).await.unwrap();
        match recv(&game, Duration::from_secs(1)).await {
            Some(Message::Guess { guess }) => assert_eq!(guess, FALLBACK_GUESS),
            other => panic!("Expected fallback guess, got {:?}", other),
        }

        publish(&game, game_over()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_newer_turn_preempts_stale_one() {
        let reasoner = Arc::new(StalledReasoner::default());
        let (_hub, game, task) = seat(reasoner).await;

        publish(&game, notice(10, 0)).await.unwrap();
        publish(&game, notice(9, 0)).await.unwrap();

        assert!(matches!(
            recv(&game, Duration::from_secs(2)).await,
            Some(Message::Question { .. })
        ));
        assert!(recv(&game, Duration::from_millis(400)).await.is_none());

        publish(&game, game_over()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_other_guessers_turn_ignored() {
        let (hub, game, task) = seat(Arc::new(ScriptedReasoner::constant("QUESTION"))).await;

        // Not addressed to Bob
        let mut other = notice(10, 0);
        if let Message::YourTurn(n) = &mut other {
            n.guesser = "Carol".into();
        }
        publish(&game, other).await.unwrap();

        // Addressed to Bob but not from the coordinator
        let carol = hub.connect("guesser-Carol");
        game.invite("guesser-Carol").await.unwrap();
        let carol_game = carol.accept_invitation(POLL).await.unwrap().unwrap();
        publish(&carol_game, notice(10, 0)).await.unwrap();

        // The coordinator sees Carol's message, and nothing from Bob
        assert!(matches!(
            recv(&game, Duration::from_millis(300)).await,
            Some(Message::YourTurn(_))
        ));
        assert!(recv(&game, Duration::from_millis(300)).await.is_none());

        publish(&game, game_over()).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_turn_guard_clears_flag_on_abort() {
        let active = Arc::new(AtomicU64::new(1));
        let guard = TurnGuard {
            id: 1,
            active: active.clone(),
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(active.load(Ordering::SeqCst), 0);

        // A guard from an older turn leaves a newer marker alone
        active.store(5, Ordering::SeqCst);
        drop(TurnGuard {
            id: 4,
            active: active.clone(),
        });
        assert_eq!(active.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_move_survives_transient_publish_failure() {
        let hub = Hub::new();
        let coord = hub.connect("coordinator");
        let game = coord.create_channel("game").await.unwrap();
        game.invite("guesser-Bob").await.unwrap();

        let faults = Faults::new();
        let endpoint = FlakyEndpoint::new(hub.connect("guesser-Bob"), faults.clone());
        let reasoner = Arc::new(ScriptedReasoner::constant("QUESTION"));
        let task = tokio::spawn(async move {
            let mut guesser = Guesser::new(endpoint, reasoner, config());
            guesser.run().await
        });
        assert!(matches!(
            recv(&game, Duration::from_secs(1)).await,
            Some(Message::AgentReady { .. })
        ));

        faults.fail_publishes("question", 2);
        publish(&game, notice(10, 0)).await.unwrap();

        // Exactly one question once the retries go through
        assert!(matches!(
            recv(&game, Duration::from_secs(1)).await,
            Some(Message::Question { .. })
        ));
        assert!(recv(&game, Duration::from_millis(300)).await.is_none());
        assert_eq!(faults.publish_attempts(), 4);

        publish(&game, game_over()).await.unwrap();
        task.await.unwrap().unwrap();
    }
}
