//! Souk session driver.
//!
//! Wires the session core to the OS keychain (or a JSON file) and the real
//! backend. Useful for exercising the token lifecycle and the session
//! validator outside the mobile app.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use souk_core::{
    ApiClient, AppState, CredentialStore, FileStore, KeyringStore, LifecycleEvent,
    LoginCredentials, ReqwestTransport, SessionConfig, SessionEvent, SessionManager,
    SessionValidator,
};

// ============================================================================
// Constants
// ============================================================================

/// Buffer for lifecycle events read from stdin
const LIFECYCLE_CHANNEL_CAPACITY: usize = 32;

/// Log file name prefix inside `SOUK_LOG_DIR`
const LOG_FILE_PREFIX: &str = "souk.log";

const USAGE: &str = "\
Usage: souk <command>

Commands:
  login <access-token> [refresh-token]   Store a session
  token                                  Print a valid access token, refreshing if needed
  status                                 Show whether a session is stored and for whom
  notice                                 Print and clear the pending session notice
  logout                                 Remove every stored session value
  watch                                  Run the session validator, reading events from stdin:
                                           route <name> | active | inactive | background

Environment:
  SOUK_STORE=keyring|file   Credential backend (default: keyring)
  SOUK_LOG_DIR=<dir>        Also write logs to a daily file in <dir>
  RUST_LOG=<filter>         Log filter (default: warn)";

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=souk_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os("SOUK_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn open_store() -> Result<Arc<dyn CredentialStore>> {
    let backend = std::env::var("SOUK_STORE").unwrap_or_else(|_| "keyring".to_string());
    match backend.as_str() {
        "keyring" => Ok(Arc::new(KeyringStore::new()?)),
        "file" => {
            let dir = SessionConfig::data_dir()?;
            let store = FileStore::in_dir(&dir);
            info!(path = %store.path().display(), "Using file credential store");
            Ok(Arc::new(store))
        }
        other => bail!("Unknown SOUK_STORE backend '{}' (expected keyring or file)", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let config = SessionConfig::load()?.with_env_overrides();
    let store = open_store()?;
    let transport = Arc::new(ReqwestTransport::new()?);
    let session = SessionManager::new(store, transport, config);

    match command.as_str() {
        "login" => login(&session, &args[1..]),
        "token" => token(&session).await,
        "status" => status(&session),
        "notice" => {
            match session.take_session_notice() {
                Some(notice) => println!("{}", notice),
                None => eprintln!("No pending notice"),
            }
            Ok(())
        }
        "logout" => session.logout(),
        "watch" => watch(session).await,
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

fn login(session: &SessionManager, args: &[String]) -> Result<()> {
    let Some(access_token) = args.first() else {
        bail!("login needs an access token\n\n{}", USAGE);
    };
    session.establish(&LoginCredentials {
        access_token: access_token.clone(),
        refresh_token: args.get(1).cloned(),
        ..Default::default()
    })?;
    eprintln!("Session stored");
    Ok(())
}

async fn token(session: &SessionManager) -> Result<()> {
    match session.get_valid_access_token().await {
        Some(token) => {
            println!("{}", token);
            Ok(())
        }
        None => {
            if let Some(notice) = session.take_session_notice() {
                eprintln!("{}", notice);
            }
            bail!("Not signed in")
        }
    }
}

fn status(session: &SessionManager) -> Result<()> {
    if !session.is_authenticated() {
        println!("signed out");
        return Ok(());
    }
    let vault = session.vault();
    println!("signed in");
    for (label, value) in [
        ("user", vault.user_id()?),
        ("role", vault.user_role()?),
        ("email", vault.user_email()?),
    ] {
        if let Some(value) = value {
            println!("  {}: {}", label, value);
        }
    }
    Ok(())
}

/// Run the validator until stdin closes or the session is torn down.
async fn watch(session: SessionManager) -> Result<()> {
    let mut session_events = session.subscribe();
    let validator = SessionValidator::new(ApiClient::new(session));
    let (tx, rx) = mpsc::channel(LIFECYCLE_CHANNEL_CAPACITY);
    let handle = validator.spawn(rx);
    info!("Watching session; type 'route <name>', 'active', 'inactive' or 'background'");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = session_events.recv() => match event {
                Ok(SessionEvent::ReauthRequired { reason, notice }) => {
                    println!("reauth required: {:?}", reason);
                    if let Some(notice) = notice {
                        println!("{}", notice);
                    }
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Missed session events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match parse_lifecycle(&line) {
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => eprintln!("Unrecognized input: {}", line.trim()),
                }
            }
        }
    }

    drop(tx);
    handle.shutdown().await;
    Ok(())
}

fn parse_lifecycle(line: &str) -> Option<LifecycleEvent> {
    let mut parts = line.split_whitespace();
    let event = match parts.next()? {
        "route" => LifecycleEvent::RouteChanged(parts.next()?.to_string()),
        "active" => LifecycleEvent::AppStateChanged(AppState::Active),
        "inactive" => LifecycleEvent::AppStateChanged(AppState::Inactive),
        "background" => LifecycleEvent::AppStateChanged(AppState::Background),
        _ => return None,
    };
    Some(event)
}
