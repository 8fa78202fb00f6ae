//! Twenty Questions runner
//!
//! One subcommand per role, each joining a shared relay:
//! - `relay`: TCP relay the agents connect through
//! - `coordinator`, `thinker`, `guesser`, `translator`: one agent each
//! - `play`: a whole table in one process over the in-process hub

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use twenty_agents::{
    Coordinator, CoordinatorConfig, Guesser, GuesserConfig, OpenAiCompatible, ReasonerConfig,
    Strategy, Thinker, ThinkerConfig, Translator, TranslatorConfig,
};
use twenty_bridge::{Hub, RelayClientConfig, RelayConfig, RelayEndpoint, RelayServer};
use twenty_core::{GameSummary, Role, RoundConfig};

const DEFAULT_RELAY: &str = "127.0.0.1:46357";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "twenty-questions", version, about = "Twenty Questions played by agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// How an agent reaches the game
#[derive(Args, Clone)]
struct Connection {
    /// Relay address
    #[arg(long, env = "RELAY_ADDR", default_value = DEFAULT_RELAY)]
    relay: String,
    #[arg(long, env = "SHARED_SECRET", default_value = "secret123")]
    shared_secret: String,
    #[arg(long, env = "GAME_CHANNEL", default_value = "classroom/game")]
    game_channel: String,
}

#[derive(Args, Clone, Copy)]
struct Limits {
    #[arg(long, env = "MAX_QUESTIONS", default_value_t = 20)]
    max_questions: u32,
    #[arg(long, env = "MAX_GUESSES", default_value_t = 3)]
    max_guesses: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Run the TCP relay
    Relay {
        #[arg(long, env = "RELAY_LISTEN", default_value = DEFAULT_RELAY)]
        listen: String,
        #[arg(long, env = "SHARED_SECRET", default_value = "secret123")]
        shared_secret: String,
    },
    /// Referee one round
    Coordinator {
        #[command(flatten)]
        connection: Connection,
        #[command(flatten)]
        limits: Limits,
        #[arg(long, default_value = "Alice")]
        thinker: String,
        #[arg(long, value_delimiter = ',', default_value = "Bob,Carol,Dave")]
        guessers: Vec<String>,
        /// Observers to invite; pass an empty value for none
        #[arg(long, value_delimiter = ',', default_value = "Travis")]
        observers: Vec<String>,
    },
    /// Keep the secret and answer questions
    Thinker {
        #[command(flatten)]
        connection: Connection,
        #[arg(long, env = "AGENT_NAME", default_value = "Alice")]
        agent_name: String,
        /// Observer to share the secret with
        #[arg(long)]
        observer: Option<String>,
    },
    /// Ask questions and guess
    Guesser {
        #[command(flatten)]
        connection: Connection,
        #[arg(long, env = "AGENT_NAME", default_value = "Bob")]
        agent_name: String,
        /// random, systematic or creative
        #[arg(long, env = "STRATEGY", default_value = "random")]
        strategy: Strategy,
    },
    /// Observe and translate the public broadcasts
    Translator {
        #[command(flatten)]
        connection: Connection,
        #[arg(long, env = "AGENT_NAME", default_value = "Travis")]
        agent_name: String,
        #[arg(long, env = "TARGET_LANGUAGE", default_value = "Hungarian")]
        target_language: String,
    },
    /// Play a full table in this process
    Play {
        #[command(flatten)]
        limits: Limits,
        #[arg(long, env = "TARGET_LANGUAGE", default_value = "Hungarian")]
        target_language: String,
    },
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Missing backend settings stop the agent before it connects
fn reasoner() -> Result<Arc<OpenAiCompatible>> {
    let config = ReasonerConfig::from_env().context("reasoning backend is not configured")?;
    let reasoner = OpenAiCompatible::new(config)?;
    info!("Reasoning with {} at {}", reasoner.model(), reasoner.endpoint());
    Ok(Arc::new(reasoner))
}

async fn connect(connection: &Connection, role: Role, name: &str) -> Result<RelayEndpoint> {
    let name = role.peer_name(name);
    let endpoint = RelayEndpoint::connect(RelayClientConfig {
        address: connection.relay.clone(),
        name: name.clone(),
        shared_secret: connection.shared_secret.clone(),
        connect_timeout: CONNECT_TIMEOUT,
    })
    .await
    .with_context(|| format!("could not join relay {} as {}", connection.relay, name))?;
    info!("Connected to relay {} as {}", connection.relay, name);
    Ok(endpoint)
}

fn round(limits: Limits) -> Result<RoundConfig> {
    Ok(RoundConfig::new(limits.max_questions, limits.max_guesses)?)
}

/// Printer for translator output
fn display() -> (mpsc::UnboundedSender<String>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            println!("{}", line);
        }
    });
    (tx, printer)
}

fn report(summary: &GameSummary) -> Result<()> {
    info!("{}", summary.result);
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

/// Run `work` until it finishes or the process is interrupted
async fn until_interrupted<F>(work: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; shutting down");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    until_interrupted(dispatch(cli.command)).await
}

async fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Relay {
            listen,
            shared_secret,
        } => {
            let server = RelayServer::new(RelayConfig {
                listen,
                shared_secret,
                ..RelayConfig::default()
            });
            server.run().await?;
        }
        Command::Coordinator {
            connection,
            limits,
            thinker,
            guessers,
            observers,
        } => {
            let mut expected_players = vec![Role::Thinker.peer_name(&thinker)];
            expected_players.extend(guessers.iter().map(|g| Role::Guesser.peer_name(g)));
            let config = CoordinatorConfig {
                round: round(limits)?,
                game_channel: connection.game_channel.clone(),
                expected_players,
                observers: observers
                    .iter()
                    .filter(|o| !o.trim().is_empty())
                    .map(|o| Role::Translator.peer_name(o))
                    .collect(),
                ..CoordinatorConfig::default()
            };
            let endpoint = connect(&connection, Role::Coordinator, "").await?;
            let summary = Coordinator::new(endpoint, config).run().await?;
            report(&summary)?;
        }
        Command::Thinker {
            connection,
            agent_name,
            observer,
        } => {
            let reasoner = reasoner()?;
            let config = ThinkerConfig {
                name: agent_name.clone(),
                game_channel: connection.game_channel.clone(),
                observer: observer
                    .map(|o| Role::Translator.peer_name(&o))
                    .or(ThinkerConfig::default().observer),
                ..ThinkerConfig::default()
            };
            let endpoint = connect(&connection, Role::Thinker, &agent_name).await?;
            let summary = Thinker::new(endpoint, reasoner, config).run().await?;
            info!("Round finished: {}", summary.result);
        }
        Command::Guesser {
            connection,
            agent_name,
            strategy,
        } => {
            let reasoner = reasoner()?;
            let config = GuesserConfig {
                name: agent_name.clone(),
                strategy,
                game_channel: connection.game_channel.clone(),
                ..GuesserConfig::default()
            };
            let endpoint = connect(&connection, Role::Guesser, &agent_name).await?;
            let summary = Guesser::new(endpoint, reasoner, config).run().await?;
            info!("Round finished: {}", summary.result);
        }
        Command::Translator {
            connection,
            agent_name,
            target_language,
        } => {
            let reasoner = reasoner()?;
            let config = TranslatorConfig {
                name: agent_name.clone(),
                target_language,
                game_channel: connection.game_channel.clone(),
                ..TranslatorConfig::default()
            };
            let endpoint = connect(&connection, Role::Translator, &agent_name).await?;
            let (tx, printer) = display();
            let summary = Translator::new(endpoint, reasoner, config, tx).run().await?;
            info!("Round finished: {}", summary.result);
            // The translator owned the only sender, so the printer drains and stops
            let _ = printer.await;
        }
        Command::Play {
            limits,
            target_language,
        } => play(limits, target_language).await?,
    }
    Ok(())
}

/// Thinker Alice, guessers Bob/Carol/Dave and translator Travis on one hub
async fn play(limits: Limits, target_language: String) -> Result<()> {
    let reasoner = reasoner()?;
    let hub = Hub::new();
    let mut players = Vec::new();

    let mut thinker = Thinker::new(
        hub.connect(&Role::Thinker.peer_name("Alice")),
        reasoner.clone(),
        ThinkerConfig::default(),
    );
    players.push(tokio::spawn(async move { thinker.run().await }));

    for (name, strategy) in [
        ("Bob", Strategy::Random),
        ("Carol", Strategy::Systematic),
        ("Dave", Strategy::Creative),
    ] {
        let mut guesser = Guesser::new(
            hub.connect(&Role::Guesser.peer_name(name)),
            reasoner.clone(),
            GuesserConfig {
                name: name.into(),
                strategy,
                ..GuesserConfig::default()
            },
        );
        players.push(tokio::spawn(async move { guesser.run().await }));
    }

    let (tx, printer) = display();
    let mut translator = Translator::new(
        hub.connect(&Role::Translator.peer_name("Travis")),
        reasoner,
        TranslatorConfig {
            target_language,
            ..TranslatorConfig::default()
        },
        tx,
    );
    players.push(tokio::spawn(async move { translator.run().await }));

    let mut coordinator = Coordinator::new(
        hub.connect(twenty_core::COORDINATOR_PEER),
        CoordinatorConfig {
            round: round(limits)?,
            ..CoordinatorConfig::default()
        },
    );
    let summary = coordinator.run().await?;

    for player in players {
        match player.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Player stopped with an error: {}", e),
            Err(e) => error!("Player task failed: {}", e),
        }
    }
    let _ = printer.await;
    report(&summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_shape() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_guesser_flags() {
        let cli = Cli::parse_from([
            "twenty-questions",
            "guesser",
            "--agent-name",
            "Carol",
            "--strategy",
            "systematic",
            "--relay",
            "10.0.0.2:9000",
        ]);
        match cli.command {
            Command::Guesser {
                connection,
                agent_name,
                strategy,
            } => {
                assert_eq!(agent_name, "Carol");
                assert_eq!(strategy, Strategy::Systematic);
                assert_eq!(connection.relay, "10.0.0.2:9000");
            }
            _ => panic!("Expected guesser"),
        }
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let parsed = Cli::try_parse_from(["twenty-questions", "guesser", "--strategy", "lucky"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_coordinator_roster_list() {
        let cli = Cli::parse_from([
            "twenty-questions",
            "coordinator",
            "--guessers",
            "Bob,Eve,Frank",
            "--max-questions",
            "10",
        ]);
        match cli.command {
            Command::Coordinator {
                limits, guessers, ..
            } => {
                assert_eq!(guessers, ["Bob", "Eve", "Frank"]);
                assert_eq!(limits.max_questions, 10);
                assert_eq!(limits.max_guesses, 3);
            }
            _ => panic!("Expected coordinator"),
        }
    }
}
