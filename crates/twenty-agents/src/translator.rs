//! Translator observer
//!
//! Watches the coordinator's broadcasts and renders the interesting ones in
//! another language on a local display sink. It has no authority over the
//! game and never publishes.

use crate::prompts;
use crate::reasoning::Reasoner;
use crate::session::{from_coordinator, next_envelope};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use twenty_bridge::{Channel, ChannelKind, Endpoint};
use twenty_core::{Envelope, GameSummary, Message, Result};

/// Broadcasts worth translating
pub const TRANSLATED_KINDS: [&str; 4] = ["answer_from_thinker", "guess_result", "game_start", "game_over"];

/// Translator configuration
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    /// Display name, e.g. `Travis`
    pub name: String,
    pub target_language: String,
    pub game_channel: String,
    pub poll_timeout: Duration,
    pub retry_delay: Duration,
    pub translate_timeout: Duration,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            name: "Travis".into(),
            target_language: "Hungarian".into(),
            game_channel: "classroom/game".into(),
            poll_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            translate_timeout: Duration::from_secs(30),
        }
    }
}

/// `[type] | key: value | …` from the scalar fields of a message
pub fn describe(message: &Message) -> String {
    let mut parts = vec![format!("[{}]", message.kind())];
    let value = serde_json::to_value(message).unwrap_or(Value::Null);
    if let Some(data) = value.get("data").and_then(Value::as_object) {
        for (key, field) in data {
            match field {
                Value::String(s) if !s.trim().is_empty() => parts.push(format!("{}: {}", key, s)),
                Value::Number(n) => parts.push(format!("{}: {}", key, n)),
                Value::Bool(b) => parts.push(format!("{}: {}", key, b)),
                _ => {}
            }
        }
    }
    parts.join(" | ")
}

/// Translator agent
pub struct Translator<E: Endpoint, R: Reasoner> {
    endpoint: Arc<E>,
    reasoner: Arc<R>,
    config: TranslatorConfig,
    display: mpsc::UnboundedSender<String>,
    secret: Arc<Mutex<Option<String>>>,
    side_tasks: Vec<JoinHandle<()>>,
}

impl<E: Endpoint, R: Reasoner> Translator<E, R> {
    /// Rendered lines are sent to `display`
    pub fn new(
        endpoint: E,
        reasoner: Arc<R>,
        config: TranslatorConfig,
        display: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            endpoint: Arc::new(endpoint),
            reasoner,
            config,
            display,
            secret: Arc::new(Mutex::new(None)),
            side_tasks: Vec::new(),
        }
    }

    /// Secret object, if the thinker has shared it
    pub fn secret(&self) -> Option<String> {
        self.secret.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Observe one round and return its summary
    pub async fn run(&mut self) -> Result<GameSummary> {
        let game = self.join().await?;
        info!(
            "Translator {} observing {} in {}",
            self.config.name,
            game.name(),
            self.config.target_language
        );

        // Private channels may still arrive after the game channel
        let endpoint = self.endpoint.clone();
        let poll = self.config.poll_timeout;
        let secret = self.secret.clone();
        let display = self.display.clone();
        self.side_tasks.push(tokio::spawn(async move {
            loop {
                match endpoint.accept_invitation(poll).await {
                    Ok(Some(channel)) if channel.kind() == ChannelKind::Private => {
                        tokio::spawn(listen_for_secret(channel, secret.clone(), display.clone(), poll));
                    }
                    Ok(Some(channel)) => debug!("Ignoring invitation to {}", channel.name()),
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("Invitation listener stopped: {}", e);
                        break;
                    }
                }
            }
        }));

        let result = self.observe(&game).await;
        for task in self.side_tasks.drain(..) {
            task.abort();
        }
        result
    }

    /// Wait for the game channel, picking up private channels on the way
    async fn join(&mut self) -> Result<E::Channel> {
        loop {
            let Some(channel) = self.endpoint.accept_invitation(self.config.poll_timeout).await?
            else {
                continue;
            };
            if channel.name() == self.config.game_channel {
                return Ok(channel);
            }
            if channel.kind() == ChannelKind::Private {
                self.side_tasks.push(tokio::spawn(listen_for_secret(
                    channel,
                    self.secret.clone(),
                    self.display.clone(),
                    self.config.poll_timeout,
                )));
            } else {
                debug!("Ignoring invitation to {}", channel.name());
            }
        }
    }

    async fn observe(&self, game: &E::Channel) -> Result<GameSummary> {
        loop {
            let Some((delivery, envelope)) =
                next_envelope(game, self.config.poll_timeout, self.config.retry_delay).await?
            else {
                continue;
            };
            if !from_coordinator(&delivery.source) {
                continue;
            }

            let message = envelope.message;
            if TRANSLATED_KINDS.contains(&message.kind()) {
                let line = self.render(&message).await;
                show(&self.display, line);
            } else {
                debug!("Not translating {}", message.kind());
            }

            if let Message::GameOver(summary) = message {
                info!("Translator {} done", self.config.name);
                return Ok(summary);
            }
        }
    }

    async fn render(&self, message: &Message) -> String {
        let text = describe(message);
        let prompt = prompts::translate(&self.config.target_language, &text);
        let reply = tokio::time::timeout(
            self.config.translate_timeout,
            self.reasoner.complete(&prompt, prompts::TRANSLATE_TOKENS),
        )
        .await;

        match reply {
            Ok(Ok(translated)) if !translated.trim().is_empty() => {
                format!("[{}] {}", self.config.target_language, translated.trim())
            }
            Ok(Ok(_)) => format!("[untranslated] {}", text),
            Ok(Err(e)) => {
                warn!("Translation failed: {}", e);
                format!("[untranslated] {}", text)
            }
            Err(_) => {
                warn!("Translation timed out");
                format!("[untranslated] {}", text)
            }
        }
    }
}

impl<E: Endpoint, R: Reasoner> Drop for Translator<E, R> {
    fn drop(&mut self) {
        for task in self.side_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Hand a line to the display; a closed display only loses the line
fn show(display: &mpsc::UnboundedSender<String>, line: String) {
    if let Err(mpsc::error::SendError(line)) = display.send(line) {
        debug!("Display is closed; dropping '{}'", line);
    }
}

async fn listen_for_secret<C: Channel>(
    channel: C,
    secret: Arc<Mutex<Option<String>>>,
    display: mpsc::UnboundedSender<String>,
    poll: Duration,
) {
    debug!("Listening for the secret on {}", channel.name());
    loop {
        match channel.receive(poll).await {
            Ok(Some(delivery)) => match Envelope::decode(&delivery.payload) {
                Ok(Envelope {
                    message: Message::SecretObject { object },
                    ..
                }) => {
                    info!("Secret received from {}", delivery.source);
                    show(&display, format!("[secret_object] | object: {}", object));
                    *secret.lock().unwrap_or_else(|p| p.into_inner()) = Some(object);
                }
                Ok(other) => debug!("Ignoring {} on private channel", other.message.kind()),
                Err(e) => warn!("Malformed private message: {}", e),
            },
            Ok(None) => continue,
            Err(e) => {
                debug!("Private channel closed: {}", e);
                break;
            }
        }
    }
}
