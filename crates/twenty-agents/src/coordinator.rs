//! Coordinator
//!
//! `CoordinatorProtocol` is the game referee as a plain state machine: it
//! takes one inbound message at a time and returns the broadcasts that
//! message causes. `Coordinator` drives it from a channel receive loop and
//! applies the pacing delay.

use crate::session::{next_envelope, publish_retrying};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use twenty_bridge::{Channel, Endpoint};
use twenty_core::{
    GameState, GameSummary, GuessOutcome, GuessRecord, Message, PlayerId, Result, Role,
    RoundConfig, Rules, TurnNotice, payload_digest,
};

/// Transcript entries carried in each `your_turn`
const TURN_LOG_WINDOW: usize = 5;

/// Round phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Collecting `agent_ready` registrations
    WaitingForPlayers,
    /// Invitation sent; collecting `game_ready`
    WaitingForReady,
    InProgress,
    Ended,
}

/// Outbound effect of handling a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Publish now
    Broadcast(Message),
    /// Publish after the pacing delay
    Paced(Message),
}

impl Directive {
    pub fn message(&self) -> &Message {
        match self {
            Directive::Broadcast(m) | Directive::Paced(m) => m,
        }
    }
}

/// Referee state machine for one round at a time
#[derive(Debug)]
pub struct CoordinatorProtocol {
    state: GameState,
    phase: Phase,
    rules: Rules,
    /// Digests of `answer` / `guess_result` payloads applied this round
    applied: HashSet<String>,
    /// Learned from the thinker's correct `guess_result`
    actual_object: Option<String>,
}

impl CoordinatorProtocol {
    pub fn new(config: RoundConfig, rules: Rules) -> Self {
        Self {
            state: GameState::new(config),
            phase: Phase::WaitingForPlayers,
            rules,
            applied: HashSet::new(),
            actual_object: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// Handle one inbound message.
    ///
    /// `source` is the sender's transport name and `payload` the raw bytes the
    /// message was decoded from, used to recognise re-deliveries.
    pub fn handle(&mut self, source: &str, payload: &[u8], message: Message) -> Vec<Directive> {
        let kind = message.kind();
        match message {
            Message::AgentReady { role, name, strategy } => self.on_agent_ready(role, name, strategy),
            Message::GameReady { role, name, .. } => self.on_game_ready(role, name),
            Message::Question { question } => {
                if !self.in_play(kind) {
                    return Vec::new();
                }
                let guesser = PlayerId::parse(source);
                self.check_turn(&guesser, kind);
                info!("{} asks: {}", guesser, question);
                vec![Directive::Broadcast(Message::QuestionForThinker {
                    guesser,
                    question,
                })]
            }
            Message::Guess { guess } => {
                if !self.in_play(kind) {
                    return Vec::new();
                }
                let guesser = PlayerId::parse(source);
                self.check_turn(&guesser, kind);
                if !self.state.can_guess(&guesser) {
                    warn!("{} has no guesses left but guessed '{}'; relaying anyway", guesser, guess);
                }
                info!("{} guesses: {}", guesser, guess);
                vec![Directive::Broadcast(Message::GuessForThinker { guesser, guess })]
            }
            Message::Answer {
                question,
                answer,
                guesser,
            } => {
                if !self.in_play(kind) || !self.first_delivery(kind, payload) {
                    return Vec::new();
                }
                self.on_answer(guesser, question, answer)
            }
            Message::GuessResult(outcome) => {
                if !self.in_play(kind) || !self.first_delivery(kind, payload) {
                    return Vec::new();
                }
                self.on_guess_result(outcome)
            }
            _ => {
                debug!("Ignoring {} from {}", kind, source);
                Vec::new()
            }
        }
    }

    /// Start over with the same roster. Re-sends the invitation when the
    /// roster is still complete.
    ///
    /// Library API for hosts that drive `handle` themselves across several
    /// rounds. `Coordinator::run` and the bundled agents play a single round.
    pub fn start_new_round(&mut self) -> Vec<Directive> {
        self.state = self.state.for_next_round();
        self.applied.clear();
        self.actual_object = None;

        if self.state.roster_complete() {
            info!("Starting a new round with {} guessers", self.state.guessers().len());
            self.phase = Phase::WaitingForReady;
            vec![Directive::Broadcast(self.invitation())]
        } else {
            self.phase = Phase::WaitingForPlayers;
            Vec::new()
        }
    }

    /// Summary of the current state, as `game_over` would report it
    pub fn summary(&self) -> GameSummary {
        let winner = self.state.winning_guess().map(|(guesser, _)| guesser.clone());
        let result = match &winner {
            Some(w) => format!("{} correctly guessed the object!", w),
            None => "Time's up! No one guessed the object.".to_string(),
        };
        GameSummary {
            winner,
            result,
            questions_asked: self.state.questions_asked(),
            total_guesses_made: self.state.total_guesses(),
            player_guesses: self.state.player_guess_counts().clone(),
            game_log: self.state.transcript().to_vec(),
            actual_object: self.actual_object.clone(),
        }
    }

    fn on_agent_ready(&mut self, role: Role, name: PlayerId, strategy: Option<String>) -> Vec<Directive> {
        if matches!(self.phase, Phase::InProgress | Phase::Ended) {
            debug!("Ignoring registration of {} after the game started", name);
            return Vec::new();
        }

        match role {
            Role::Thinker => {
                if self.state.register_thinker(name.clone()) {
                    info!("Thinker registered: {}", name);
                }
            }
            Role::Guesser => {
                if self.state.register_guesser(name.clone()) {
                    info!(
                        "Guesser registered: {} ({}) [{}]",
                        name,
                        strategy.as_deref().unwrap_or("default"),
                        self.state.guessers().len()
                    );
                } else {
                    debug!("Duplicate registration from {}", name);
                }
            }
            other => {
                debug!("{} {} is observing", other, name);
                return Vec::new();
            }
        }

        if self.phase == Phase::WaitingForPlayers && self.state.roster_complete() {
            info!(
                "Roster complete: thinker {} with guessers {:?}; sending invitation",
                self.state.thinker().map(|t| t.as_str()).unwrap_or("?"),
                self.state.guessers().iter().map(|g| g.as_str()).collect::<Vec<_>>()
            );
            self.phase = Phase::WaitingForReady;
            return vec![Directive::Broadcast(self.invitation())];
        }
        Vec::new()
    }

    fn on_game_ready(&mut self, role: Role, name: PlayerId) -> Vec<Directive> {
        if self.phase != Phase::WaitingForReady {
            debug!("Ignoring game_ready from {} in {:?}", name, self.phase);
            return Vec::new();
        }

        match role {
            Role::Thinker => {
                info!("Thinker {} has chosen an object", name);
                self.state.mark_thinker_ready();
            }
            Role::Guesser if self.state.is_guesser(&name) => {
                if self.state.mark_guesser_ready(name.clone()) {
                    info!(
                        "Guesser {} ready ({}/{})",
                        name,
                        self.state.ready_guessers(),
                        self.state.guessers().len()
                    );
                }
            }
            _ => {
                warn!("game_ready from unregistered {} {}", role, name);
                return Vec::new();
            }
        }

        if !self.state.all_ready() {
            return Vec::new();
        }

        self.phase = Phase::InProgress;
        self.state.start();
        info!("All players ready; game on");

        let config = self.state.config();
        let mut out = vec![Directive::Broadcast(Message::GameStart {
            thinker: self.state.thinker().cloned(),
            guessers: self.state.guessers().to_vec(),
            max_questions: config.max_questions,
            max_guesses_per_player: config.max_guesses_per_player,
        })];
        out.extend(self.turn_notice().map(Directive::Broadcast));
        out
    }

    fn on_answer(&mut self, guesser: PlayerId, question: String, answer: String) -> Vec<Directive> {
        let turn_number = self
            .state
            .record_question(guesser.clone(), question.clone(), answer.clone());
        info!(
            "Q{}/{} {}: {} -> {}",
            turn_number,
            self.state.config().max_questions,
            guesser,
            question,
            answer
        );

        let mut out = vec![Directive::Broadcast(Message::AnswerFromThinker {
            guesser,
            question,
            answer,
            turn_number,
        })];
        out.extend(self.settle());
        out
    }

    fn on_guess_result(&mut self, outcome: GuessOutcome) -> Vec<Directive> {
        let GuessOutcome {
            guesser,
            guess,
            correct,
            actual_object,
        } = outcome;

        match self.state.record_guess(guesser.clone(), guess.clone(), correct) {
            GuessRecord::OverCap => {
                warn!(
                    "Discarding guess '{}' from {}: already used {} guesses",
                    guess,
                    guesser,
                    self.state.guesses_used(&guesser)
                );
                return self.settle();
            }
            GuessRecord::Recorded => {}
        }

        if correct {
            info!("{} guessed '{}' correctly", guesser, guess);
            if actual_object.is_none() {
                warn!("Correct guess result did not carry the object");
            }
            self.actual_object = actual_object.or_else(|| Some(guess.clone()));
        } else {
            info!(
                "{} guessed '{}' - wrong ({}/{})",
                guesser,
                guess,
                self.state.guesses_used(&guesser),
                self.state.config().max_guesses_per_player
            );
        }

        let public = GuessOutcome::new(
            guesser,
            guess,
            correct,
            self.actual_object.as_deref().unwrap_or_default(),
        );
        let mut out = vec![Directive::Broadcast(Message::GuessResult(public))];
        out.extend(self.settle());
        out
    }

    /// End the round if it is over, else hand the turn on
    fn settle(&mut self) -> Vec<Directive> {
        if self.state.is_game_over() {
            self.phase = Phase::Ended;
            self.state.finish();
            let summary = self.summary();
            info!("Game over: {}", summary.result);
            return vec![Directive::Broadcast(Message::GameOver(summary))];
        }

        self.state.advance_turn();
        self.turn_notice().map(Directive::Paced).into_iter().collect()
    }

    fn turn_notice(&self) -> Option<Message> {
        let guesser = self.state.current_guesser()?.clone();
        debug!("Turn {} goes to {}", self.state.turn_index(), guesser);
        Some(Message::YourTurn(TurnNotice {
            guesser,
            questions_remaining: self.state.questions_remaining(),
            player_guesses: self.state.player_guess_counts().clone(),
            max_guesses_per_player: self.state.config().max_guesses_per_player,
            game_log: self.state.recent_log(TURN_LOG_WINDOW).to_vec(),
        }))
    }

    fn invitation(&self) -> Message {
        let config = self.state.config();
        Message::GameInvitation {
            max_questions: config.max_questions,
            max_guesses_per_player: config.max_guesses_per_player,
            rules: self.rules.clone(),
        }
    }

    fn in_play(&self, kind: &str) -> bool {
        if self.phase == Phase::InProgress && self.state.is_active() {
            return true;
        }
        debug!("Ignoring {} in {:?}", kind, self.phase);
        false
    }

    fn check_turn(&self, sender: &PlayerId, kind: &str) {
        if self.state.current_guesser() != Some(sender) {
            warn!(
                "{} from {} out of turn (current: {}); relaying anyway",
                kind,
                sender,
                self.state.current_guesser().map(|g| g.as_str()).unwrap_or("none")
            );
        }
    }

    fn first_delivery(&mut self, kind: &str, payload: &[u8]) -> bool {
        if self.applied.insert(payload_digest(payload)) {
            return true;
        }
        debug!("Ignoring re-delivered {}", kind);
        false
    }
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub round: RoundConfig,
    pub rules: Rules,
    /// Group channel the game is played on
    pub game_channel: String,
    /// Transport names invited at startup
    pub expected_players: Vec<String>,
    /// Optional observers, also invited at startup
    pub observers: Vec<String>,
    pub poll_timeout: Duration,
    /// Delay before announcing the next turn
    pub pacing_delay: Duration,
    /// Pause after a transient channel error
    pub retry_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            round: RoundConfig::default(),
            rules: Rules::default(),
            game_channel: "classroom/game".into(),
            expected_players: vec![
                Role::Thinker.peer_name("Alice"),
                Role::Guesser.peer_name("Bob"),
                Role::Guesser.peer_name("Carol"),
                Role::Guesser.peer_name("Dave"),
            ],
            observers: vec![Role::Translator.peer_name("Travis")],
            poll_timeout: Duration::from_secs(1),
            pacing_delay: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Coordinator agent
pub struct Coordinator<E: Endpoint> {
    endpoint: E,
    config: CoordinatorConfig,
    protocol: CoordinatorProtocol,
}

impl<E: Endpoint> Coordinator<E> {
    pub fn new(endpoint: E, config: CoordinatorConfig) -> Self {
        let protocol = CoordinatorProtocol::new(config.round, config.rules.clone());
        Self {
            endpoint,
            config,
            protocol,
        }
    }

    pub fn protocol(&self) -> &CoordinatorProtocol {
        &self.protocol
    }

    /// Open the game channel, invite the cast and referee one round
    pub async fn run(&mut self) -> Result<GameSummary> {
        let channel = self.endpoint.create_channel(&self.config.game_channel).await?;
        info!(
            "Coordinator created {} (max {} questions, {} guesses each)",
            channel.name(),
            self.config.round.max_questions,
            self.config.round.max_guesses_per_player
        );

        for peer in self.config.expected_players.iter().chain(&self.config.observers) {
            match channel.invite(peer).await {
                Ok(()) => info!("Invited {}", peer),
                Err(e) => warn!("Could not invite {}: {}", peer, e),
            }
        }

        self.referee(&channel).await
    }

    /// Receive loop; returns once `game_over` has been published
    pub async fn referee(&mut self, channel: &E::Channel) -> Result<GameSummary> {
        loop {
            let Some((delivery, envelope)) =
                next_envelope(channel, self.config.poll_timeout, self.config.retry_delay).await?
            else {
                continue;
            };

            let directives =
                self.protocol
                    .handle(&delivery.source, &delivery.payload, envelope.message);

            for directive in directives {
                if let Directive::Paced(_) = directive {
                    tokio::time::sleep(self.config.pacing_delay).await;
                }
                let message = match directive {
                    Directive::Broadcast(m) | Directive::Paced(m) => m,
                };
                let finished = match &message {
                    Message::GameOver(summary) => Some(summary.clone()),
                    _ => None,
                };
                publish_retrying(channel, message, self.config.retry_delay).await?;
                if let Some(summary) = finished {
                    return Ok(summary);
                }
            }
        }
    }
}
