// ============================================================================
// zeteo-cache - Entitlement cache inspection tool
// ============================================================================
// Usage:
//   zeteo-cache stats                      Show cache statistics
//   zeteo-cache list                       List cached entitlements
//   zeteo-cache get <ADDRESS>              Print one cached payload
//   zeteo-cache evict <ADDRESS>            Drop one cached payload
//   zeteo-cache prune [--dry-run]          Remove expired entries
//   zeteo-cache export --format json       Export all entries as JSON
//   zeteo-cache lookup <ADDRESS>           Read the subscription from the ledger
//   zeteo-cache resolve <ADDRESS>          Run the read path once (writes cache)
// ============================================================================

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use zeteo_core::cache::{CacheStore, StoredEntry};
use zeteo_core::config::CacheLocation;
use zeteo_core::{
    Address, Clock, EntitlementCache, EntitlementPayload, RedbCache, ReconciliationEngine,
    Resolution, ServiceConfig, SystemClock,
};

/// Zeteo entitlement cache tool
#[derive(Parser)]
#[command(name = "zeteo-cache", version, about = "Inspect and manage the Zeteo entitlement cache")]
struct Cli {
    /// Path to the cache file (default: ZETEO_CACHE_PATH or ~/.zeteo/cache.redb)
    #[arg(long, global = true)]
    cache_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cache statistics (entries, live/expired, size)
    Stats,

    /// List cached entitlements
    List {
        /// Include expired entries
        #[arg(long)]
        all: bool,
    },

    /// Print the cached payload for an account
    Get { address: String },

    /// Remove the cached payload for an account
    Evict { address: String },

    /// Remove expired entries
    Prune {
        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Export every entry as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Read an account's subscription straight from the ledger
    Lookup { address: String },

    /// Resolve an account through the full read path, writing through the cache
    Resolve { address: String },
}

fn format_timestamp(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn parse_address(raw: &str) -> Result<Address> {
    Address::parse(raw).map_err(|e| anyhow!("Invalid address '{}': {}", raw, e))
}

fn decode_payload(entry: &StoredEntry) -> Option<EntitlementPayload> {
    serde_json::from_slice(&entry.value).ok()
}

fn resolve_cache_path(cli_path: Option<PathBuf>, config: &ServiceConfig) -> Result<PathBuf> {
    if let Some(path) = cli_path {
        return Ok(path);
    }
    match &config.cache_location {
        CacheLocation::Path(path) => Ok(path.clone()),
        CacheLocation::Default => RedbCache::default_path(),
        CacheLocation::Disabled => {
            anyhow::bail!("No cache configured for production; pass --cache-path or set ZETEO_CACHE_PATH")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::from_env()?;

    if let Commands::Lookup { address } = &cli.command {
        return cmd_lookup(&config, address).await;
    }

    let path = resolve_cache_path(cli.cache_path, &config)?;
    let cache = RedbCache::open(&path)?;

    match cli.command {
        Commands::Stats => cmd_stats(&cache),
        Commands::List { all } => cmd_list(&cache, all),
        Commands::Get { address } => cmd_get(&cache, &address).await,
        Commands::Evict { address } => cmd_evict(&cache, &address).await,
        Commands::Prune { dry_run } => cmd_prune(&cache, dry_run),
        Commands::Export { format } => cmd_export(&cache, &format),
        Commands::Resolve { address } => cmd_resolve(&config, cache, &address).await,
        Commands::Lookup { .. } => Ok(()),
    }
}

fn cmd_stats(cache: &RedbCache) -> Result<()> {
    let stats = cache.stats()?;

    println!("=== Zeteo Entitlement Cache Stats ===");
    println!("Cache:   {}", cache.path().display());
    println!();
    println!("Entries: {} total", stats.total_entries);
    println!("  {:8} {}", "live", stats.live_entries);
    println!("  {:8} {}", "expired", stats.expired_entries);
    println!("Size:    {} bytes", stats.total_bytes);

    Ok(())
}

fn cmd_list(cache: &RedbCache, include_expired: bool) -> Result<()> {
    let now = SystemClock.now();
    let entries: Vec<StoredEntry> = cache
        .entries()?
        .into_iter()
        .filter(|e| include_expired || !e.is_expired(now))
        .collect();

    if entries.is_empty() {
        println!("No cached entitlements.");
        return Ok(());
    }

    println!(
        "{:<20}  {:<10}  {:<24}  {:>9}  {}",
        "ACCOUNT", "TIER", "SUBSCRIPTION EXPIRY", "OFFERINGS", "CACHE EXPIRES"
    );
    println!("{}", "-".repeat(100));

    for entry in &entries {
        match decode_payload(entry) {
            Some(payload) => println!(
                "{:<20}  {:<10}  {:<24}  {:>9}  {}",
                payload.account.short(),
                payload.tier.display_name(),
                format_timestamp(payload.expiry),
                payload.offerings.len(),
                format_timestamp(entry.expires_at)
            ),
            None => println!("{:<20}  (undecodable entry: {})", "?", entry.key),
        }
    }

    println!("\nTotal: {} entries", entries.len());
    Ok(())
}

async fn cmd_get(cache: &RedbCache, address: &str) -> Result<()> {
    let account = parse_address(address)?;
    let store: Arc<dyn CacheStore> = Arc::new(cache.clone());
    let entitlements = EntitlementCache::new(store, 0);

    match entitlements.load(&account).await {
        Some(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
        None => println!("No cached entitlement for {}", account),
    }
    Ok(())
}

async fn cmd_evict(cache: &RedbCache, address: &str) -> Result<()> {
    let account = parse_address(address)?;
    let store: Arc<dyn CacheStore> = Arc::new(cache.clone());

    if EntitlementCache::new(store, 0).evict(&account).await? {
        println!("Evicted cached entitlement for {}", account);
    } else {
        println!("No cached entitlement for {}", account);
    }
    Ok(())
}

fn cmd_prune(cache: &RedbCache, dry_run: bool) -> Result<()> {
    if dry_run {
        println!("=== DRY RUN - no data will be deleted ===\n");

        let now = SystemClock.now();
        let expired: Vec<StoredEntry> = cache
            .entries()?
            .into_iter()
            .filter(|e| e.is_expired(now))
            .collect();

        println!("Would prune {} expired entries", expired.len());
        for entry in &expired {
            println!("  - {} (expired: {})", entry.key, format_timestamp(entry.expires_at));
        }
    } else {
        let pruned = cache.prune_expired()?;
        println!("Pruned {} expired entries", pruned);
    }

    Ok(())
}

fn cmd_export(cache: &RedbCache, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let stats = cache.stats()?;
    let entries: Vec<serde_json::Value> = cache
        .entries()?
        .iter()
        .map(|entry| {
            serde_json::json!({
                "key": entry.key,
                "stored_at": entry.stored_at,
                "expires_at": entry.expires_at,
                "payload": decode_payload(entry),
            })
        })
        .collect();

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": stats,
        "entries": entries,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

async fn cmd_lookup(config: &ServiceConfig, address: &str) -> Result<()> {
    let account = parse_address(address)?;
    let oracle = config.oracle(config.chain_client()?)?;
    let record = oracle.get_subscription_or_none(&account).await;
    let now = SystemClock.now();

    println!("Account: {}", record.account);
    println!("Tier:    {} ({})", record.tier.rank(), record.tier.display_name());
    println!("Expiry:  {}", format_timestamp(record.expiry));
    println!("Active:  {}", record.is_active(now));
    Ok(())
}

async fn cmd_resolve(config: &ServiceConfig, cache: RedbCache, address: &str) -> Result<()> {
    let account = parse_address(address)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let oracle = config.oracle(config.chain_client()?)?;
    let engine = ReconciliationEngine::new(
        Arc::new(oracle),
        Arc::new(config.curator(clock.clone())?),
        EntitlementCache::new(Arc::new(cache), config.cache_ttl_secs),
        clock,
    );

    match engine.resolve_detailed(&account).await {
        Ok(resolution) => {
            let source = match &resolution {
                Resolution::Cached(_) => "cache hit".to_string(),
                Resolution::Rebuilt { stored, .. } => format!("rebuilt (cached: {})", stored),
            };
            eprintln!("Source: {}", source);
            println!("{}", serde_json::to_string_pretty(resolution.payload())?);
            Ok(())
        }
        Err(e) => anyhow::bail!("{} ({})", e, e.code()),
    }
}
