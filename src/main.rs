mod config;
mod db;
mod error;
mod extraction;
mod health;
mod http;
mod permissions;
mod settings;
mod skills;
mod trust;
mod users;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::health::{MetricsCollector, SelfHealer};
use crate::settings::SettingsStore;
use crate::skills::health_analyzer_skill::HealthAnalyzerSkill;
use crate::skills::update_watcher_skill::UpdateWatcherSkill;
use crate::skills::SkillRegistry;
use crate::users::{Role, UserStore};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    if args.iter().any(|a| a == "--default-config") {
        print!("{}", default_config_contents());
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config: {e}");
            return;
        }
    };

    info!(
        bind = %config.bind,
        interval_seconds = config.scheduler.interval_seconds,
        "skillmesh starting"
    );

    let data_dir = Config::data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!("failed to create data directory {}: {e}", data_dir.display());
        return;
    }

    let db_path = data_dir.join("skillmesh.db");
    let db = match db::open(&db_path) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to open database: {e}");
            return;
        }
    };
    let db = Arc::new(Mutex::new(db));

    let users = Arc::new(UserStore::new(db.clone()));
    let settings = Arc::new(SettingsStore::new(db.clone()));

    let owner_id = match bootstrap_owner(&users).await {
        Ok(id) => id,
        Err(e) => {
            error!("failed to bootstrap owner account: {e}");
            return;
        }
    };

    // Heartbeat timeout is a soft per-skill deadline; two skills are
    // currently registered so an even split leaves headroom for both.
    let heartbeat_timeout = Duration::from_secs(config.scheduler.interval_seconds.max(2) / 2);

    // The collector and healer must observe the *real* registry (the one
    // these two meta-skills are themselves registered into) so that
    // `skills_metrics` and `restart_skill` see the actual running skill set
    // rather than an always-empty stand-in. That's circular — the registry
    // needs the health skill, which needs the collector/healer, which need
    // a handle to the registry — so `Arc::new_cyclic` hands both a `Weak`
    // to the registry before it exists; the weak handle only needs to
    // resolve once heartbeats start, by which point construction is done.
    let registration_failed = std::cell::Cell::new(false);
    let registry = Arc::new_cyclic(|weak_registry| {
        let mut registry = SkillRegistry::new(heartbeat_timeout);

        let collector = Arc::new(MetricsCollector::new(weak_registry.clone()));
        let healer = Arc::new(SelfHealer::new(db.clone(), weak_registry.clone(), config.health.cooldown_seconds));

        let health_skill = Arc::new(HealthAnalyzerSkill::new(db.clone(), collector, healer, owner_id.clone()));
        if let Err(e) = registry.register(health_skill) {
            error!("failed to register health_analyzer skill: {e}");
            registration_failed.set(true);
        }

        // The release oracle, update applier, and post-apply health check are
        // external collaborators reached only through their traits (§1); none
        // is wired in by default, so the skill heartbeats as a no-op until an
        // operator supplies concrete implementations.
        let update_skill = Arc::new(UpdateWatcherSkill::new(
            db.clone(),
            config.update_watcher.auto_apply,
            owner_id.clone(),
            env!("CARGO_PKG_VERSION"),
        ));
        if let Err(e) = registry.register(update_skill) {
            error!("failed to register update_watcher skill: {e}");
            registration_failed.set(true);
        }

        registry
    });

    if registration_failed.get() {
        return;
    }

    let init_results = registry.initialize_all().await;
    for (name, ok) in &init_results {
        if *ok {
            info!(skill = %name, "skill initialized");
        } else {
            warn!(skill = %name, "skill failed to initialize");
        }
    }

    let app_state = http::AppState {
        registry: registry.clone(),
        users: users.clone(),
        settings,
        api_secret: config.api_secret.clone(),
    };
    let app = http::build(app_state);

    let bind_addr = config.bind.clone();
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {bind_addr}: {e}");
            return;
        }
    };
    info!(addr = %bind_addr, "skills HTTP server listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {e}");
        }
    });

    let heartbeat_handle = {
        let registry = registry.clone();
        let users = users.clone();
        let interval = Duration::from_secs(config.scheduler.interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let user_ids: Vec<String> = match users.list().await {
                    Ok(list) => list.into_iter().map(|u| u.id).collect(),
                    Err(e) => {
                        warn!("failed to list users for heartbeat: {e}");
                        Vec::new()
                    }
                };
                let actions = registry.run_heartbeat(&user_ids).await;
                if !actions.is_empty() {
                    info!(count = actions.len(), "heartbeat actions produced");
                }
            }
        })
    };

    info!("skillmesh is running — press Ctrl+C to stop");

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl+c");

    info!("shutdown signal received, stopping...");
    heartbeat_handle.abort();
    server_handle.abort();
    registry.cleanup_all().await;
    info!("skillmesh stopped");
}

/// Ensure at least one owner account exists. `OWNER_USERNAME` /
/// `OWNER_PASSWORD` seed the very first owner; later owners are created
/// through `/users` by an existing owner.
async fn bootstrap_owner(users: &UserStore) -> crate::error::Result<String> {
    let existing = users.list().await?;
    if let Some(owner) = existing.iter().find(|u| u.role == Role::Owner) {
        return Ok(owner.id.clone());
    }

    let username = std::env::var("OWNER_USERNAME").unwrap_or_else(|_| "owner".to_string());
    let password = std::env::var("OWNER_PASSWORD")
        .map_err(|_| AppError::Fatal("OWNER_PASSWORD must be set to bootstrap the first owner account".to_string()))?;

    let owner = users.create(&username, "Owner", &password, Role::Owner).await?;
    info!(username = %owner.username, "bootstrapped initial owner account");
    Ok(owner.id)
}

fn default_config_contents() -> String {
    toml::to_string_pretty(&Config::default()).unwrap_or_default()
}

fn print_usage() {
    println!(
        "skillmesh — capability and control plane for a personal AI assistant

USAGE:
    skillmesh [OPTIONS]

OPTIONS:
    --config <PATH>     Path to config file (default: ~/.config/skillmesh/config.toml)
    --default-config    Print default config to stdout and exit
    -h, --help          Print this help message

ENVIRONMENT:
    OWNER_USERNAME        Username for the bootstrapped owner account (default: \"owner\")
    OWNER_PASSWORD        Required on first run. Password for the bootstrapped owner account.
    RUST_LOG              Optional. Tracing filter (default: info).
"
    );
}
