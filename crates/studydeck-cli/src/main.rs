//! Studydeck CLI - sign in to a study server and keep the session in sync.
//!
//! Every invocation is one "tab" on the shared storage file: logging in or
//! out here is picked up by a running `studydeck watch` in another terminal.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use studydeck_core::{
    AuthSession, AuthSessionController, Config, Credentials, FileStorage, LogoutOptions,
    PendingRequest,
};

const USAGE: &str = "Usage: studydeck <command>

Commands:
  login [email]   Sign in (password from STUDYDECK_PASSWORD or prompt)
  logout          Sign out and clear the stored token
  whoami          Show the current session
  get <path>      Send an authenticated GET and print the response body
  watch           Follow session changes made by other terminals";

/// Initialize the tracing subscriber for logging.
/// Logs go to stderr, or to a daily file when `log_dir` is configured; the
/// returned guard must live until exit so buffered lines get flushed.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match config.log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "studydeck.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

fn load_config() -> Result<Config> {
    let mut config = Config::load()?;
    if let Ok(url) = std::env::var("STUDYDECK_API_URL") {
        config.api_base_url = url;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let mut config = load_config()?;
    let _log_guard = init_tracing(&config);
    info!(command, server = %config.api_base_url, "Studydeck starting");

    let storage = FileStorage::open(config.storage_path()?)?;
    let controller = Arc::new(AuthSessionController::connect(&config, Arc::clone(&storage))?);

    match command {
        "login" => login(&controller, &mut config, args.get(1).cloned()).await,
        "logout" => {
            let redirect = controller.logout(LogoutOptions::default()).await;
            println!("Logged out (next: {})", redirect);
            Ok(())
        }
        "whoami" => {
            let session = controller.bootstrap().await;
            print_session(&session);
            Ok(())
        }
        "get" => {
            let Some(path) = args.get(1) else {
                bail!("get requires a path, e.g. `studydeck get /api/cards`");
            };
            controller.bootstrap().await;
            let response = controller.api().send(PendingRequest::get(path.as_str())).await?;
            println!("{}", response.body);
            Ok(())
        }
        "watch" => watch(&controller, &storage, &config).await,
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command `{}`\n\n{}", other, USAGE),
    }
}

async fn login(
    controller: &AuthSessionController,
    config: &mut Config,
    email: Option<String>,
) -> Result<()> {
    let email = match email
        .or_else(|| std::env::var("STUDYDECK_EMAIL").ok())
        .or_else(|| config.last_email.clone())
    {
        Some(email) => email,
        None => prompt_email()?,
    };
    let password = match std::env::var("STUDYDECK_PASSWORD") {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password(format!("Password for {}: ", email))
            .context("Failed to read password")?,
    };

    let session = controller.login(&Credentials::new(email.clone(), password)).await?;

    config.last_email = Some(email);
    config.save()?;

    print_session(&session);
    Ok(())
}

fn prompt_email() -> Result<String> {
    print!("Email: ");
    io::stdout().flush()?;
    let mut email = String::new();
    io::stdin().read_line(&mut email)?;
    let email = email.trim().to_string();
    if email.is_empty() {
        bail!("An email address is required");
    }
    Ok(email)
}

async fn watch(
    controller: &AuthSessionController,
    storage: &Arc<FileStorage>,
    config: &Config,
) -> Result<()> {
    let mut changes = controller.subscribe();
    let poller = storage.watch(config.sync_interval());

    print_session(&controller.bootstrap().await);
    eprintln!("Watching {} (Ctrl-C to stop)", storage.path().display());

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let session = changes.borrow_and_update().clone();
                print_session(&session);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    poller.abort();
    info!("Stopped watching");
    Ok(())
}

fn print_session(session: &AuthSession) {
    match (&session.user, session.is_logged_in()) {
        (Some(user), _) => println!("{:?}: {} <{}>", session.phase, user.display_name(), user.email),
        (None, true) => println!("{:?}: profile not loaded", session.phase),
        (None, false) => println!("{:?}", session.phase),
    }
    if let Ok(json) = serde_json::to_string(session) {
        info!(session = %json, "Session state");
    }
}
