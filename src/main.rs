//! Kiosk entitlements diagnostic CLI.
//!
//! Local-only surface over the persisted verdict cache and the policy
//! configuration. Reconciliation against the ledger and the platform store
//! only runs inside the app process; this tool inspects what it left behind.

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiosk_entitlements::cache::FileCache;
use kiosk_entitlements::cli::{Cli, Commands};
use kiosk_entitlements::config::EntitlementsConfig;
use kiosk_entitlements::identity::Identity;
use kiosk_entitlements::verdict::now_ms;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Quiet by default - only show errors unless explicitly verbose.
    let filter = if cli.verbose { "debug" } else { "error" };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let config_path = cli.config.clone();
    let config = match &config_path {
        Some(path) => EntitlementsConfig::load_from(path.clone()),
        None => EntitlementsConfig::load(),
    };

    let cache_path = cli
        .cache
        .clone()
        .unwrap_or_else(FileCache::default_path);

    match cli.command {
        Commands::Status { json } => handle_status(&cache_path, json),
        Commands::Invalidate { user, guest } => handle_invalidate(&cache_path, user, guest),
        Commands::Config { list, get, set } => {
            handle_config(config_path.as_deref(), config, list, get, set)
        }
    }
}

fn handle_status(cache_path: &std::path::Path, json: bool) -> anyhow::Result<()> {
    let cache = FileCache::open_at(cache_path.to_path_buf());
    let entries = cache.entries();

    if json {
        let doc: Vec<serde_json::Value> = entries
            .iter()
            .map(|(key, entry)| {
                serde_json::json!({
                    "identity": key,
                    "entry": entry,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No cached verdicts at {}", cache_path.display());
        return Ok(());
    }

    let now = now_ms();
    println!("Cached verdicts ({}):", cache_path.display());
    for (key, entry) in entries {
        let verdict = &entry.verdict;
        let standing = if verdict.is_entitled {
            "entitled"
        } else {
            "not entitled"
        };
        let expiry = match verdict.expires_at {
            Some(ts) => format!(", expires {}", format_timestamp(ts)),
            None => String::new(),
        };
        println!(
            "  {key}: {standing} ({:?}, source {:?}{expiry}) - cached {} ago",
            verdict.tier,
            verdict.source,
            format_age(entry.age_ms(now)),
        );
    }

    Ok(())
}

fn handle_invalidate(
    cache_path: &std::path::Path,
    user: Option<String>,
    guest: Option<String>,
) -> anyhow::Result<()> {
    use kiosk_entitlements::cache::VerdictCache;

    let cache = FileCache::open_at(cache_path.to_path_buf());

    match (user, guest) {
        (Some(user_id), None) => {
            let identity = Identity::authenticated(user_id);
            cache
                .remove(&identity)
                .context("failed to drop cached verdict")?;
            println!("Dropped cached verdict for {}", identity.cache_key());
        }
        (None, Some(local_id)) => {
            let identity = Identity::guest(local_id);
            cache
                .remove(&identity)
                .context("failed to drop cached verdict")?;
            println!("Dropped cached verdict for {}", identity.cache_key());
        }
        _ => {
            cache.clear().context("failed to clear verdict cache")?;
            println!("Cleared all cached verdicts");
        }
    }

    Ok(())
}

fn handle_config(
    config_path: Option<&std::path::Path>,
    mut config: EntitlementsConfig,
    list: bool,
    get: Option<String>,
    set: Option<String>,
) -> anyhow::Result<()> {
    if let Some(assignment) = set {
        let (key, value) = assignment
            .split_once('=')
            .context("expected KEY=VALUE, e.g. policy.positive_ttl_hours=12")?;
        config.set(key.trim(), value.trim())?;
        match config_path {
            Some(path) => config.save_to(path.to_path_buf())?,
            None => config.save()?,
        }
        println!("{} = {}", key.trim(), value.trim());
        return Ok(());
    }

    if let Some(key) = get {
        match config.get(&key) {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("unknown configuration key: {key}"),
        }
        return Ok(());
    }

    if list {
        for (key, value) in config.list() {
            println!("{key} = {value}");
        }
        for rule in &config.products {
            println!("products.{} = {:?}", rule.id, rule.tier);
        }
        return Ok(());
    }

    anyhow::bail!("nothing to do: pass --list, --get KEY, or --set KEY=VALUE")
}

fn format_timestamp(unix_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(unix_ms as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| format!("{unix_ms}ms"))
}

fn format_age(age_ms: u64) -> String {
    let secs = age_ms / 1000;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 60 * 60 {
        format!("{}m", secs / 60)
    } else if secs < 24 * 60 * 60 {
        format!("{}h", secs / (60 * 60))
    } else {
        format!("{}d", secs / (24 * 60 * 60))
    }
}
