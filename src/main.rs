//! objcache CLI
//!
//! Operator tooling for an objcache cache directory.

use clap::{Parser, Subcommand};
use objcache::manifest::{F_MANIFEST, F_OBJECT};
use objcache::{CacheConfig, CacheManifest, CompilerCache, StatsSnapshot};
use objcache_store::{CacheStore, FileCacheStore};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "objcache")]
#[command(about = "Dependency-tracking compiler output cache", version)]
struct Cli {
    /// Cache directory (overrides OBJCACHE_DIR and the config file)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the manifest stored under a key
    Show {
        /// Session hash of the entry
        key: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List stored entries
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show hit/miss totals and cache size
    Stats {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove an entry
    Evict {
        /// Session hash of the entry
        key: String,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("OBJCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match CacheConfig::from_environment() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(1);
        }
    };
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }

    match cli.command {
        Commands::Show { key, json } => run_show(&config, &key, json),
        Commands::List { json } => run_list(&config, json),
        Commands::Stats { json } => run_stats(&config, json),
        Commands::Evict { key } => run_evict(config, &key),
        Commands::Config => run_config(&config),
    }
}

fn open_store(config: &CacheConfig) -> FileCacheStore {
    match FileCacheStore::new(&config.cache_dir) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening cache at {}: {}", config.cache_dir.display(), e);
            process::exit(1);
        }
    }
}

fn run_show(config: &CacheConfig, key: &str, json_output: bool) {
    let store = open_store(config);

    if !store.contains_entry(key, F_MANIFEST) {
        eprintln!("No entry for {}", key);
        process::exit(1);
    }

    let manifest = match store
        .open_entry(key, F_MANIFEST)
        .map_err(objcache::CacheError::from)
        .and_then(CacheManifest::from_reader)
    {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Error reading manifest for {}: {}", key, e);
            process::exit(1);
        }
    };

    if json_output {
        if let Err(e) = manifest.to_writer(std::io::stdout()) {
            eprintln!("Error serializing output: {}", e);
            process::exit(1);
        }
        println!();
        return;
    }

    println!("Entry {}", manifest.session_hash);
    println!("  Created: {}", manifest.timestamp);
    println!("  Build time: {}ms", manifest.duration_ms);
    println!("  Exit code: {}", manifest.exit_code);
    if manifest.disable {
        println!("  Disabled: yes");
    }
    if let Some(ref pp) = manifest.preprocessed_source_hash {
        println!("  Preprocessed source: {}", pp);
    }
    if let Some(ref pdb) = manifest.pdb_hash {
        println!("  Debug file: {}", pdb);
    }
    if store.contains_entry(key, F_OBJECT) {
        println!("  Object: {}", store.entry_path(key, F_OBJECT).display());
    }
    if !manifest.include_files.is_empty() {
        println!("  Dependencies ({}):", manifest.include_files.len());
        for (path, hash) in &manifest.include_files {
            println!("    {}  {}", short_hash(hash), path.display());
        }
    }
    if !manifest.potential_new_includes.is_empty() {
        println!("  Watched for creation ({}):", manifest.potential_new_includes.len());
        for path in &manifest.potential_new_includes {
            println!("    {}", path.display());
        }
    }
}

/// First 12 characters of a digest for display.
fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}

fn run_list(config: &CacheConfig, json_output: bool) {
    let store = open_store(config);
    let keys = match store.list_keys() {
        Ok(k) => k,
        Err(e) => {
            eprintln!("Error listing cache: {}", e);
            process::exit(1);
        }
    };

    if json_output {
        let output: Vec<serde_json::Value> = keys
            .iter()
            .map(|k| {
                serde_json::json!({
                    "key": k.key,
                    "entries": k.entries,
                    "size": k.size,
                })
            })
            .collect();
        match serde_json::to_string_pretty(&output) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    if keys.is_empty() {
        println!("Cache is empty: {}", store.root().display());
        return;
    }
    for k in &keys {
        println!("{}  {:>10}  {}", k.key, k.size, k.entries.join(","));
    }
}

fn run_stats(config: &CacheConfig, json_output: bool) {
    let store = open_store(config);
    let totals = StatsSnapshot::load(store.root());
    let disk_bytes = store.total_size();

    if json_output {
        let output = serde_json::json!({
            "cache_dir": store.root(),
            "cache_hits": totals.cache_hits,
            "cache_misses": totals.cache_misses,
            "cache_objects": totals.cache_objects,
            "cache_size": totals.cache_size,
            "hit_ratio": totals.hit_ratio(),
            "disk_bytes": disk_bytes,
        });
        match serde_json::to_string_pretty(&output) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(1);
            }
        }
        return;
    }

    println!("Cache: {}", store.root().display());
    println!("  Hits: {}", totals.cache_hits);
    println!("  Misses: {}", totals.cache_misses);
    println!("  Hit ratio: {:.1}%", totals.hit_ratio() * 100.0);
    println!("  Objects stored: {}", totals.cache_objects);
    println!("  Bytes stored: {}", totals.cache_size);
    println!("  On disk: {}", disk_bytes);
}

fn run_evict(config: CacheConfig, key: &str) {
    let cache = match CompilerCache::open(config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error opening cache: {}", e);
            process::exit(1);
        }
    };

    match cache.evict(key) {
        Ok(true) => println!("Evicted {}", key),
        Ok(false) => {
            println!("No entry for {}", key);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("Error evicting {}: {}", key, e);
            process::exit(1);
        }
    }
}

fn run_config(config: &CacheConfig) {
    match config.to_toml() {
        Ok(text) => print!("{}", text),
        Err(e) => {
            eprintln!("Error serializing config: {}", e);
            process::exit(1);
        }
    }
}
