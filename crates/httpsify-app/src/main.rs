//! Httpsify - local forward proxy that upgrades HTTP traffic to HTTPS.
//!
//! Point a browser's HTTP proxy at the listen address. Requests for sites a
//! ruleset covers are upgraded, and `http` links in pages are rewritten.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use httpsify_core::{rule_states_from_json, EngineConfig, HttpsRewriter, RuleSets, StaticBlacklist};
use httpsify_proxy::{CaManager, ProxyConfig, ProxyServer, UpgradeMode, DEFAULT_PROXY_PORT};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Httpsify - HTTP to HTTPS rewriting proxy
#[derive(Parser, Debug)]
#[command(name = "httpsify", version, about)]
struct Args {
    /// Ruleset catalogue (XML)
    #[arg(long)]
    rulesets: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    port: u16,

    /// JSON object of ruleset name to "true"/"false" overrides
    #[arg(long)]
    rule_states: Option<PathBuf>,

    /// User agent used to decide which platform-specific rulesets apply
    #[arg(long)]
    user_agent: Option<String>,

    /// Do not rewrite links inside response bodies
    #[arg(long)]
    no_rewrite_pages: bool,

    /// Rewrite bodies of every content type, not just text
    #[arg(long)]
    aggressive: bool,

    /// Answer upgradable requests with a redirect instead of fetching them
    #[arg(long)]
    redirect: bool,

    /// Do not mark cookies Secure
    #[arg(long)]
    no_secure_cookies: bool,

    /// Intercept HTTPS tunnels (requires trusting the generated CA)
    #[arg(long)]
    intercept_https: bool,

    /// Directory for the interception CA
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Domains whose cookies must never be secured, one per line
    #[arg(long)]
    blacklist: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("org", "httpsify", "Httpsify").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize console logging plus a daily rotated log file when possible.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "httpsify={0},httpsify_core={0},httpsify_proxy={0},warn",
            log_level
        ))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("httpsify")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stdout))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::info!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Builds the engine settings, reading the override file if given.
fn engine_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = EngineConfig::new();

    if let Some(user_agent) = &args.user_agent {
        config = config.with_user_agent(user_agent.clone());
    }

    if let Some(path) = &args.rule_states {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule states from {:?}", path))?;
        let states = rule_states_from_json(&json)
            .with_context(|| format!("Invalid rule states in {:?}", path))?;
        tracing::info!("Loaded {} ruleset state overrides", states.len());
        config = config.with_rule_active_states(states);
    }

    Ok(config)
}

fn load_blacklist(path: &Path) -> anyhow::Result<StaticBlacklist> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cookie blacklist from {:?}", path))?;
    let blacklist = StaticBlacklist::parse(&text);
    tracing::info!("Loaded {} blacklisted cookie domains", blacklist.len());
    Ok(blacklist)
}

fn proxy_config(args: &Args) -> ProxyConfig {
    let upgrade_mode = if args.redirect {
        UpgradeMode::Redirect
    } else {
        UpgradeMode::Forward
    };

    let mut config = ProxyConfig::new()
        .with_addr((args.address, args.port).into())
        .with_rewrite_pages(!args.no_rewrite_pages)
        .with_aggressive(args.aggressive)
        .with_upgrade_mode(upgrade_mode)
        .with_secure_cookies(!args.no_secure_cookies)
        .with_intercept_https(args.intercept_https);

    if let Some(dir) = &args.ca_dir {
        config = config.with_ca_manager(CaManager::new(dir));
    }
    config
}

/// Loads the catalogue and wraps it in the rewriting facade.
fn build_rewriter(args: &Args) -> anyhow::Result<HttpsRewriter> {
    let mut rules = RuleSets::new(engine_config(args)?).with_span(tracing::info_span!("engine"));
    if let Some(path) = &args.blacklist {
        rules = rules.with_blacklist(Arc::new(load_blacklist(path)?));
    }

    let summary = rules
        .load_file(&args.rulesets)
        .with_context(|| format!("Failed to load rulesets from {:?}", args.rulesets))?;
    if summary.loaded == 0 {
        tracing::warn!("No rulesets loaded from {:?}", args.rulesets);
    }
    tracing::info!(
        "Platform {}, {} rulesets under {} targets",
        rules.platform().as_str(),
        rules.len(),
        rules.target_count()
    );

    Ok(HttpsRewriter::new(Arc::new(rules)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep guard alive for the duration of the program
    let _log_guard = init_logging(&args);

    tracing::info!("Starting Httpsify...");
    tracing::debug!("Args: {:?}", args);

    let rewriter = build_rewriter(&args)?;
    let server = ProxyServer::new(proxy_config(&args), rewriter)?;

    if let Some(path) = server.ca_cert_path() {
        tracing::info!("Trust {:?} in the browser to allow HTTPS interception", path);
    }

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    tracing::info!("Httpsify shutting down");
    Ok(())
}
