use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use aisle_client_core::client::AssistantClient;
use aisle_client_core::config::{EngineConfig, SessionMode};
use aisle_client_core::history::HistoryError;
use aisle_client_core::session::ConnectionState;
use aisle_client_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use aisle_client_core::transcript::Sender;
use clap::{Args, Parser};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = EngineConfig {
        agent_url: cli.agent_url,
        history_url: cli.history_url,
        user_id: cli.user,
        mode: cli.mode,
        session_id: cli.session,
        ..EngineConfig::default()
    };

    let client = AssistantClient::new(config)?;
    spawn_state_reporter(&client);
    spawn_transcript_printer(&client);

    println!("aisle: type a message, or /record, /video <camera|screen|off>, /history, /interrupt, /reconnect, /quit");
    client.connect().await;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" => break,
            "/interrupt" => client.interrupt_assistant(),
            "/reconnect" => client.reconnect_now(),
            "/history" => client.load_more_history().await,
            "/record" => {
                if client.is_recording().await {
                    client.stop_recording().await;
                    println!("· recording stopped");
                } else if let Err(err) = client.start_recording().await {
                    eprintln!("⚠️  {err}");
                } else {
                    println!("· recording...");
                }
            }
            "/video camera" => {
                if let Err(err) = client.initialize_webcam().await {
                    eprintln!("⚠️  {err}");
                }
            }
            "/video screen" => {
                if let Err(err) = client.initialize_screen_share().await {
                    eprintln!("⚠️  {err}");
                }
            }
            "/video off" => client.stop_video().await,
            text => client.send_text_message(text),
        }
    }

    client.close().await;
    Ok(())
}

fn spawn_state_reporter(client: &AssistantClient) {
    let mut state = client.connection_state();
    tokio::spawn(async move {
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => println!("· connected"),
                ConnectionState::Reconnecting => println!("· reconnecting..."),
                ConnectionState::Failed => {
                    println!("· connection failed; use /reconnect to retry")
                }
                ConnectionState::Idle | ConnectionState::Connecting => {}
            }
            if state.changed().await.is_err() {
                break;
            }
        }
    });
}

fn spawn_transcript_printer(client: &AssistantClient) {
    let client = client.clone();
    tokio::spawn(async move {
        let mut printed: HashSet<String> = HashSet::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            ticker.tick().await;
            let snapshot = client.transcript();
            let last_index = snapshot.messages.len().saturating_sub(1);
            for (index, message) in snapshot.messages.iter().enumerate() {
                // Ids can be rewritten when the server echo is reconciled;
                // the timestamp survives, so key on it.
                let key = format!("{:?}|{}", message.sender, message.timestamp);
                if printed.contains(&key) {
                    continue;
                }
                // Hold back the message still being streamed.
                if index == last_index && snapshot.is_assistant_typing {
                    continue;
                }
                let label = match message.sender {
                    Sender::User => "you",
                    Sender::Assistant => "aisle",
                    Sender::System => "system",
                };
                println!("[{label}] {}", message.text);
                printed.insert(key);
            }
        }
    });
}

#[derive(Parser, Debug)]
#[command(
    name = "aisle",
    about = "💍 Always-on multimodal assistant client for wedding planning sessions",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        env = "AISLE_AGENT_URL",
        default_value = "127.0.0.1:8000/ws",
        help = "Agent WebSocket endpoint"
    )]
    agent_url: String,

    #[arg(
        long,
        env = "AISLE_HISTORY_URL",
        default_value = "127.0.0.1:8000",
        help = "History REST base URL"
    )]
    history_url: String,

    #[arg(long, env = "AISLE_USER_ID", default_value = "guest")]
    user: String,

    #[arg(
        long,
        value_enum,
        env = "AISLE_MODE",
        default_value_t = SessionMode::Live,
        help = "Agent conversation mode"
    )]
    mode: SessionMode,

    #[arg(long, env = "AISLE_SESSION_ID", help = "Resume an existing session")]
    session: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "AISLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "AISLE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to initialize logging: {0}")]
    Logging(String),
    #[error(transparent)]
    Engine(#[from] HistoryError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
