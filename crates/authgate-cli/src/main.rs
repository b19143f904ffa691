//! authgate - sign in, inspect and use an API session from the terminal.
//!
//! Commands:
//! - `login [username]`  sign in (password from `AUTHGATE_PASSWORD` or a prompt)
//! - `logout`            sign out, clearing the local session
//! - `status`            show the session state and expiry
//! - `whoami`            print the signed-in user as JSON
//! - `get <path> [--cached]` authenticated GET against the API

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use authgate_core::cache::CacheManager;
use authgate_core::notify::{Notification, NotificationLevel, Notifier};
use authgate_core::{
    ApiError, AuthErrorKind, Config, Credentials, Guard, GuardDecision, HttpIdentityProvider,
    HttpProfileSource, ReqwestTransport, RequestGateway, SessionManager, SignInResult, TokenStore,
    ViewAccess,
};

// ============================================================================
// Constants
// ============================================================================

const ENV_PASSWORD: &str = "AUTHGATE_PASSWORD";
const ENV_LOG_FILE: &str = "AUTHGATE_LOG_FILE";

/// How long to wait for the cache to settle on exit.
const SHUTDOWN_GRACE_MS: u64 = 500;

const USAGE: &str = "Usage: authgate <login [username] | logout | status | whoami | get <path> [--cached]>";

/// Prints notifications to stderr, keeping stdout for command output.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, n: Notification) {
        let tag = match n.level {
            NotificationLevel::Success => "ok",
            NotificationLevel::Error => "error",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Info => "info",
        };
        eprintln!("[{}] {}: {}", tag, n.title, n.message);
    }
}

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` controls the level (default `warn`). With
/// `AUTHGATE_LOG_FILE=1` a daily log file is also written to the log dir;
/// the returned guard must live until exit to flush it.
fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    let log_dir = std::env::var(ENV_LOG_FILE)
        .ok()
        .filter(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .and_then(|_| config.log_dir().ok());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "authgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(filter)
                .init();
            None
        }
    }
}

struct App {
    config: Config,
    manager: SessionManager,
    gateway: RequestGateway,
    cache: Arc<CacheManager>,
}

fn build(config: Config) -> Result<App> {
    let provider = HttpIdentityProvider::with_timeout(&config.auth_base_url, config.auth_timeout())
        .context("Failed to build identity provider client")?;
    let profiles = HttpProfileSource::new(&config.api_base_url, config.auth_timeout())
        .context("Failed to build profile client")?;
    let transport = ReqwestTransport::new(&config.api_base_url, config.request_timeout())
        .context("Failed to build API client")?;
    let store = TokenStore::new(config.session_backend()?);

    let manager = SessionManager::new(
        Arc::new(provider),
        Arc::new(profiles),
        store,
        Arc::new(ConsoleNotifier),
        config.manager_config(),
    );
    let gateway = RequestGateway::new(manager.clone(), Arc::new(transport));
    let cache = Arc::new(CacheManager::new(config.cache_dir()?)?);

    Ok(App {
        config,
        manager,
        gateway,
        cache,
    })
}

#[tokio::main]
async fn main() {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Ignoring unreadable config: {:#}", e);
        Config::default()
    });
    config.apply_env();

    let _log_guard = init_tracing(&config);
    info!("authgate starting");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        bail!(USAGE);
    };

    let mut app = build(config)?;
    let invalidation = Arc::clone(&app.cache).spawn_invalidation(app.manager.subscribe());
    app.manager.init().await;

    let result = match command.as_str() {
        "login" => login(&mut app, args.get(1).cloned()).await,
        "logout" => {
            app.manager.sign_out().await;
            Ok(())
        }
        "status" => status(&app),
        "whoami" => whoami(&app).await,
        "get" => {
            let Some(path) = args.get(1) else {
                bail!(USAGE);
            };
            let cached = args.iter().skip(2).any(|a| a == "--cached");
            get(&app, path, cached).await
        }
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'. {}", other, USAGE),
    };

    // Let the cache observe the final state before exiting
    drop(app);
    let _ = tokio::time::timeout(Duration::from_millis(SHUTDOWN_GRACE_MS), invalidation).await;
    result
}

async fn login(app: &mut App, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| app.config.last_username.clone()) {
        Some(u) => u,
        None => prompt_username()?,
    };
    let password = match std::env::var(ENV_PASSWORD) {
        Ok(p) if !p.is_empty() => p,
        _ => rpassword::prompt_password("Password: ")?,
    };

    match app.manager.sign_in(Credentials::new(&username, password)).await {
        Ok(SignInResult::SignedIn(user)) => {
            app.config.last_username = Some(username);
            if let Err(e) = app.config.save() {
                warn!(error = %e, "Failed to save config");
            }
            println!("Signed in as {}", user.display_name());
            Ok(())
        }
        Ok(SignInResult::ChallengeRequired(challenge)) => {
            bail!(
                "The identity provider requires a '{}' challenge, which this tool cannot answer",
                challenge.name
            )
        }
        Err(e) => bail!("{}", e.kind.user_message()),
    }
}

fn prompt_username() -> Result<String> {
    print!("Username: ");
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    Ok(username.trim().to_string())
}

fn status(app: &App) -> Result<()> {
    let state = app.manager.state();
    println!("State: {}", state.phase().label());
    if let Some(error) = state.error() {
        println!("Last error: {}", error.user_message());
    }
    if let Some(user) = state.user() {
        println!("User: {}", user.display_name());
        if !user.profile_loaded {
            println!("Profile: not loaded");
        }
    }
    if let Some(session) = app.manager.token_store().get() {
        println!(
            "Session expires in {} minutes ({})",
            session.minutes_until_expiry(),
            session.expires_at.to_rfc3339()
        );
        println!(
            "Refresh: {}",
            if session.can_refresh() { "available" } else { "not available" }
        );
    }
    Ok(())
}

async fn whoami(app: &App) -> Result<()> {
    let mut guard = Guard::new(app.manager.subscribe())
        .with_paths(&app.config.sign_in_path, &app.config.home_path);
    if let GuardDecision::Redirect(target) = guard.can_render_path(ViewAccess::RequireAuth, "/whoami").await {
        bail!("Not signed in (sign in at {})", target);
    }

    let user = match app.manager.state().user() {
        Some(user) if user.profile_loaded => user.clone(),
        _ => app.manager.reload_profile().await?,
    };
    println!("{}", serde_json::to_string_pretty(&user)?);
    Ok(())
}

async fn get(app: &App, path: &str, cached: bool) -> Result<()> {
    let cache_key = format!("get_{}", path);
    if cached {
        if let Some(hit) = app.cache.load::<serde_json::Value>(&cache_key)? {
            if !hit.is_stale() {
                eprintln!("(cached {})", hit.age_display());
                println!("{}", serde_json::to_string_pretty(&hit.data)?);
                return Ok(());
            }
        }
    }

    let value: serde_json::Value = match app.gateway.get_json(path).await {
        Ok(value) => value,
        Err(ApiError::Auth(e)) if e.kind == AuthErrorKind::SessionExpired => {
            bail!("Session expired. Run `authgate login` to sign in again.")
        }
        Err(e) => return Err(e.into()),
    };
    if let Err(e) = app.cache.save(&cache_key, &value) {
        warn!(error = %e, "Failed to cache response");
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
