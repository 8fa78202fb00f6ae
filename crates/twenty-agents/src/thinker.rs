//! Thinker
//!
//! Picks the secret object on invitation, answers relayed questions with a
//! strict yes/no, and judges relayed guesses. The secret is also pushed to
//! the observer over a private channel without holding up the round.

use crate::prompts;
use crate::reasoning::{Prompt, Reasoner};
use crate::session::{from_coordinator, join_game, next_envelope, publish_retrying};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use twenty_bridge::{Channel, Endpoint};
use twenty_core::{GameSummary, GuessOutcome, Message, PlayerId, Result, Role, Rules};

/// Used when the reasoner cannot pick an object
pub const FALLBACK_OBJECT: &str = "apple";

/// Thinker configuration
#[derive(Debug, Clone)]
pub struct ThinkerConfig {
    /// Display name, e.g. `Alice`
    pub name: String,
    pub game_channel: String,
    /// Transport name of the observer that is told the secret
    pub observer: Option<String>,
    /// How long to wait for the observer to be reachable
    pub secret_wait: Duration,
    pub poll_timeout: Duration,
    pub retry_delay: Duration,
    pub reasoning_timeout: Duration,
}

impl Default for ThinkerConfig {
    fn default() -> Self {
        Self {
            name: "Alice".into(),
            game_channel: "classroom/game".into(),
            observer: Some(Role::Translator.peer_name("Travis")),
            secret_wait: Duration::from_secs(20),
            poll_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            reasoning_timeout: Duration::from_secs(30),
        }
    }
}

/// The round's secret
#[derive(Debug, Clone)]
struct Secret {
    object: String,
    description: String,
}

/// Reduce a reply to one lowercase word
fn normalize_object(reply: &str) -> Option<String> {
    let word: String = reply
        .split_whitespace()
        .next()?
        .chars()
        .filter(|c| c.is_alphabetic())
        .collect::<String>()
        .to_lowercase();
    (!word.is_empty()).then_some(word)
}

/// Anything not starting with "yes" is a no
fn normalize_answer(reply: &str) -> &'static str {
    let reply = reply
        .trim()
        .trim_start_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if reply.starts_with("yes") { "yes" } else { "no" }
}

/// Thinker agent
pub struct Thinker<E: Endpoint, R: Reasoner> {
    endpoint: Arc<E>,
    reasoner: Arc<R>,
    config: ThinkerConfig,
    me: PlayerId,
    secret: Option<Secret>,
    disclosure: Option<JoinHandle<()>>,
}

impl<E: Endpoint, R: Reasoner> Thinker<E, R> {
    pub fn new(endpoint: E, reasoner: Arc<R>, config: ThinkerConfig) -> Self {
        let me = PlayerId::parse(&config.name);
        Self {
            endpoint: Arc::new(endpoint),
            reasoner,
            config,
            me,
            secret: None,
            disclosure: None,
        }
    }

    /// The chosen object, once picked
    pub fn object(&self) -> Option<&str> {
        self.secret.as_ref().map(|s| s.object.as_str())
    }

    /// Join the game and serve the round until `game_over`
    pub async fn run(&mut self) -> Result<GameSummary> {
        let channel =
            join_game(self.endpoint.as_ref(), &self.config.game_channel, self.config.poll_timeout)
                .await?;
        publish_retrying(
            &channel,
            Message::AgentReady {
                role: Role::Thinker,
                name: self.me.clone(),
                strategy: None,
            },
            self.config.retry_delay,
        )
        .await?;
        info!("Thinker {} registered", self.me);

        loop {
            let Some((delivery, envelope)) =
                next_envelope(&channel, self.config.poll_timeout, self.config.retry_delay).await?
            else {
                continue;
            };
            if !from_coordinator(&delivery.source) {
                continue;
            }

            match envelope.message {
                Message::GameInvitation { rules, .. } => {
                    self.choose_object(&rules).await;
                    self.disclose_secret();
                    publish_retrying(
                        &channel,
                        Message::GameReady {
                            role: Role::Thinker,
                            name: self.me.clone(),
                            object_chosen: Some(true),
                        },
                        self.config.retry_delay,
                    )
                    .await?;
                }
                Message::QuestionForThinker { guesser, question } => {
                    let Some(answer) = self.answer(&question).await else {
                        warn!("Question from {} before an object was chosen", guesser);
                        continue;
                    };
                    info!("{} asked '{}': {}", guesser, question, answer);
                    publish_retrying(
                        &channel,
                        Message::Answer {
                            question,
                            answer: answer.to_string(),
                            guesser,
                        },
                        self.config.retry_delay,
                    )
                    .await?;
                }
                Message::GuessForThinker { guesser, guess } => {
                    let Some(secret) = self.secret.clone() else {
                        warn!("Guess from {} before an object was chosen", guesser);
                        continue;
                    };
                    let correct = self.check_guess(&secret.object, &guess).await;
                    info!(
                        "{} guessed '{}': {}",
                        guesser,
                        guess,
                        if correct { "correct" } else { "wrong" }
                    );
                    let outcome = GuessOutcome::new(guesser, guess, correct, &secret.object);
                    publish_retrying(&channel, Message::GuessResult(outcome), self.config.retry_delay)
                        .await?;
                }
                Message::GameOver(summary) => {
                    info!("Game over: {}", summary.result);
                    if let Some(task) = self.disclosure.take() {
                        task.abort();
                    }
                    return Ok(summary);
                }
                other => debug!("Thinker ignores {}", other.kind()),
            }
        }
    }

    async fn ask(&self, prompt: &Prompt, max_tokens: u32, what: &str) -> Option<String> {
        match tokio::time::timeout(
            self.config.reasoning_timeout,
            self.reasoner.complete(prompt, max_tokens),
        )
        .await
        {
            Ok(Ok(text)) => Some(text),
            Ok(Err(e)) => {
                warn!("Reasoning for {} failed: {}", what, e);
                None
            }
            Err(_) => {
                warn!("Reasoning for {} timed out", what);
                None
            }
        }
    }

    async fn choose_object(&mut self, rules: &Rules) {
        let prompt = prompts::choose_object(rules, &mut rand::thread_rng());
        let object = self
            .ask(&prompt, prompts::OBJECT_TOKENS, "object choice")
            .await
            .and_then(|reply| normalize_object(&reply))
            .unwrap_or_else(|| {
                warn!("Falling back to '{}'", FALLBACK_OBJECT);
                FALLBACK_OBJECT.to_string()
            });

        let description = self
            .ask(
                &prompts::describe_object(&object),
                prompts::DESCRIPTION_TOKENS,
                "object description",
            )
            .await
            .unwrap_or_default();

        info!("Thinking of '{}' (shh!)", object);
        self.secret = Some(Secret {
            object,
            description,
        });
    }

    /// Push the secret to the observer in the background
    fn disclose_secret(&mut self) {
        let (Some(observer), Some(object)) = (
            self.config.observer.clone(),
            self.secret.as_ref().map(|s| s.object.clone()),
        ) else {
            return;
        };
        if let Some(previous) = self.disclosure.take() {
            previous.abort();
        }

        let endpoint = self.endpoint.clone();
        let wait = self.config.secret_wait;
        let retry = self.config.retry_delay;
        self.disclosure = Some(tokio::spawn(async move {
            let channel = match endpoint.open_private(&observer, wait).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("No private channel to {}: {}; continuing without it", observer, e);
                    return;
                }
            };
            match publish_retrying(&channel, Message::SecretObject { object }, retry).await {
                Ok(()) => info!("Sent the secret to {} on {}", observer, channel.name()),
                Err(e) => warn!("Could not send the secret to {}: {}", observer, e),
            }
        }));
    }

    async fn answer(&self, question: &str) -> Option<&'static str> {
        let secret = self.secret.as_ref()?;
        let prompt = prompts::answer_question(&secret.object, &secret.description, question);
        let answer = match self.ask(&prompt, prompts::ANSWER_TOKENS, "answer").await {
            Some(reply) => normalize_answer(&reply),
            None => "no",
        };
        Some(answer)
    }

    async fn check_guess(&self, object: &str, guess: &str) -> bool {
        if guess.trim().eq_ignore_ascii_case(object.trim()) {
            return true;
        }
        let prompt = prompts::check_guess(object, guess);
        self.ask(&prompt, prompts::CHECK_TOKENS, "guess check")
            .await
            .is_some_and(|reply| normalize_answer(&reply) == "yes")
    }
}

impl<E: Endpoint, R: Reasoner> Drop for Thinker<E, R> {
    fn drop(&mut self) {
        if let Some(task) = self.disclosure.take() {
            task.abort();
        }
    }
}
