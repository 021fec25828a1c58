//! Sightline command-line host
//!
//! Answers one question per invocation and prints every progress event to
//! stdout as a JSON line. Logs go to stderr.

mod config;

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::AppConfig;
use pipeline_engine::{CancellationToken, EventSink, TerminalOutcome};
use pipeline_steps::{default_steps, StepCollaborators};
use sightline_collaborators::{
    HttpQueryBackend, InMemoryHistoryStore, JsonLinesEventSink, OpenAiClient,
};
use sightline_session_service::SessionService;

/// Answer analytics questions with an LLM-driven query pipeline
#[derive(Parser)]
#[command(name = "sightline-cli", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (default: <config dir>/sightline/config.json)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask one question and stream its progress
    Ask {
        /// The question to answer
        question: String,

        /// User the session belongs to
        #[arg(long, default_value = "local")]
        user: String,

        /// Conversation session ID
        #[arg(long, default_value = "default")]
        session: String,
    },
    /// Print the effective configuration as JSON
    ShowConfig,
    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(2)
        }
    }
}

/// Returns whether the command succeeded.
async fn run(cli: Cli) -> Result<bool, Box<dyn Error>> {
    let config = match (&cli.command, cli.config.as_deref()) {
        // init-config may name a file that does not exist yet
        (Commands::InitConfig { .. }, Some(path)) if !path.exists() => AppConfig::default(),
        (_, path) => AppConfig::load(path).await?,
    };

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(true)
        }
        Commands::InitConfig { force } => {
            let path = cli
                .config
                .or_else(AppConfig::default_path)
                .ok_or("no config directory on this platform, pass --config")?;
            if path.exists() && !force {
                log::error!("{:?} already exists, pass --force to overwrite", path);
                return Ok(false);
            }
            config.save(&path).await?;
            Ok(true)
        }
        Commands::Ask {
            question,
            user,
            session,
        } => {
            let outcome = ask(&config, user, session, question).await?;
            Ok(outcome.is_success())
        }
    }
}

async fn ask(
    config: &AppConfig,
    user: String,
    session: String,
    question: String,
) -> Result<TerminalOutcome, Box<dyn Error>> {
    let llm = Arc::new(OpenAiClient::from_config(&config.llm));
    let collaborators = StepCollaborators {
        completion: llm.clone(),
        extraction: llm,
        query_backend: Arc::new(HttpQueryBackend::new(config.query_backend.clone())),
        options: config.llm.options.clone(),
    };
    let history = match config.history_max_turns {
        Some(max_turns) => InMemoryHistoryStore::with_max_turns(max_turns),
        None => InMemoryHistoryStore::new(),
    };
    let service = SessionService::new(
        default_steps(&collaborators),
        Arc::new(history),
        config.service.clone(),
    )?;

    let cancellation = CancellationToken::new();
    let on_interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let sink: Arc<dyn EventSink> = Arc::new(JsonLinesEventSink::stdout());
    let outcome = service.serve(user, session, question, cancellation, sink).await?;

    match &outcome {
        TerminalOutcome::Success(response) => {
            log::info!(
                "Answered via {:?} route (validated: {})",
                response.route,
                response.validated
            )
        }
        TerminalOutcome::Failure(failure) => {
            log::warn!(
                "Run failed in {}: {} ({})",
                failure.stage,
                failure.detail,
                failure.error_kind.as_str()
            )
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ask() {
        let cli =
            Cli::try_parse_from(["sightline-cli", "ask", "How many orders?", "--user", "alice"])
                .unwrap();
        match cli.command {
            Commands::Ask {
                question,
                user,
                session,
            } => {
                assert_eq!(question, "How many orders?");
                assert_eq!(user, "alice");
                assert_eq!(session, "default");
            }
            _ => panic!("expected ask"),
        }
    }

    #[tokio::test]
    async fn test_init_config_writes_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sightline").join("config.json");
        let arg = path.to_string_lossy().to_string();

        let init = ["sightline-cli", "--config", arg.as_str(), "init-config"];
        let cli = Cli::try_parse_from(init).unwrap();
        assert!(run(cli).await.unwrap());
        let written = AppConfig::load(Some(&path)).await.unwrap();
        assert_eq!(written, AppConfig::default());

        // A second run without --force leaves the file alone.
        let cli = Cli::try_parse_from(init).unwrap();
        assert!(!run(cli).await.unwrap());

        let forced = ["sightline-cli", "--config", arg.as_str(), "init-config", "--force"];
        let cli = Cli::try_parse_from(forced).unwrap();
        assert!(run(cli).await.unwrap());
    }
}
