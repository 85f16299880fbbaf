mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use cli::{Cli, Commands};
use octofhir_cache::{CacheClient, CacheConfig, RedisEventStream, loader, metrics};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = loader::load_config(cli.config.as_deref()).map_err(anyhow::Error::msg)?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    octofhir_cache::init_tracing_with_level(&config.logging.level);

    if let Commands::Watch = cli.command {
        return watch(config).await;
    }

    // One-shot commands never warm or subscribe
    config.cache_warming.enabled = false;
    config.event_invalidation.enabled = false;
    let client = CacheClient::connect(config).await.context("connecting to cache")?;

    let outcome = execute(&client, &cli.command).await;
    client.shutdown().await.context("closing cache connections")?;
    outcome
}

async fn execute(client: &CacheClient, command: &Commands) -> Result<()> {
    match command {
        Commands::Get(args) => match client.get(&args.key, args.local).await? {
            Some(value) => print_value(&value),
            None => println!("{}", "(nil)".dimmed()),
        },
        Commands::Set(args) => {
            let value: Value = serde_json::from_str(&args.value)
                .unwrap_or_else(|_| Value::String(args.value.clone()));
            let ttl = args.ttl_secs.map(Duration::from_secs);
            client.set(&args.key, &value, ttl).await?;
            print_success(&format!("Set {}", args.key));
        }
        Commands::Del(args) => {
            let deleted = client.del(&args.keys).await?;
            print_success(&format!("Deleted {deleted} key(s)"));
        }
        Commands::Keys(args) => {
            let keys = client.keys(&args.pattern).await?;
            if keys.is_empty() {
                println!("{}", "(empty)".dimmed());
            }
            for key in keys {
                println!("{key}");
            }
        }
        Commands::Invalidate(args) => {
            let deleted = client.invalidate_pattern(&args.pattern).await?;
            print_success(&format!("Invalidated {deleted} key(s) matching {}", args.pattern));
        }
        Commands::Incr(args) => {
            let value = client.incr(&args.key).await?;
            println!("{value}");
        }
        Commands::Watch => anyhow::bail!("watch is not a one-shot command"),
    }
    Ok(())
}

async fn watch(mut config: CacheConfig) -> Result<()> {
    let node = config
        .nodes
        .first()
        .cloned()
        .context("watch needs at least one cluster node for the event stream")?;
    config.event_invalidation.enabled = true;

    metrics::init_metrics();
    let events = RedisEventStream::new(&node, config.event_invalidation.channel_prefix.clone())?;
    let client = CacheClient::builder(config)
        .event_stream(Arc::new(events))
        .connect()
        .await
        .context("connecting to cache")?;

    println!(
        "{} Watching for invalidation events, press Ctrl-C to stop",
        "→".cyan()
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    client.shutdown().await.context("closing cache connections")?;
    if let Some(rendered) = metrics::render_metrics() {
        println!("{rendered}");
    }
    print_success("Stopped");
    Ok(())
}

fn print_value(value: &Value) {
    match value {
        Value::String(s) => println!("{s}"),
        other => match serde_json::to_string_pretty(other) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{other}"),
        },
    }
}

fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}
