use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "octofhir-cache")]
#[command(about = "Inspect and operate the OctoFHIR cache")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ./octofhir-cache.toml when present)
    #[arg(short, long, global = true, env = "OCTOFHIR_CACHE_CONFIG")]
    pub config: Option<String>,

    /// Log level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read a key
    Get(GetArgs),
    /// Write a key (JSON values are stored as JSON, anything else as a string)
    Set(SetArgs),
    /// Delete keys
    Del(DelArgs),
    /// List keys matching a glob pattern
    Keys(PatternArgs),
    /// Delete every key matching a glob pattern
    Invalidate(PatternArgs),
    /// Increment a counter
    Incr(KeyArgs),
    /// Run event-driven invalidation until Ctrl-C
    Watch,
}

#[derive(clap::Args)]
pub struct GetArgs {
    pub key: String,
    /// Check the in-process tier first
    #[arg(long)]
    pub local: bool,
}

#[derive(clap::Args)]
pub struct SetArgs {
    pub key: String,
    pub value: String,
    /// TTL in seconds (default from config, 0 = no expiry)
    #[arg(long)]
    pub ttl_secs: Option<u64>,
}

#[derive(clap::Args)]
pub struct DelArgs {
    #[arg(required = true)]
    pub keys: Vec<String>,
}

#[derive(clap::Args)]
pub struct PatternArgs {
    pub pattern: String,
}

#[derive(clap::Args)]
pub struct KeyArgs {
    pub key: String,
}
