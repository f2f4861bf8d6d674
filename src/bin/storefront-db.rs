//! storefront-db: inspect and poke a storefront SQLite store from the shell.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use storefront_db::prelude::*;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "storefront-db")]
#[command(about = "Diagnostics for the storefront SQLite store", long_about = None)]
struct Args {
    /// Database path or `sqlite://` URL (ignored when --config is given)
    #[arg(short, long, default_value = "storefront.db")]
    url: String,

    /// JSON file with store options
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Open the store read-only
    #[arg(long)]
    read_only: bool,

    /// Per-statement timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print a metrics snapshot after the command
    #[arg(long)]
    metrics: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the store and run integrity and foreign-key checks
    Check,
    /// Run a query and print the rows as JSON
    Query {
        sql: String,
        /// Positional parameters; integers, floats and `null` are recognised
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
    /// Run a statement and print the change count and last insert id
    Exec {
        sql: String,
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), StoreError> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("storefront_db={log_level},warn"))),
        )
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let options = load_options(&args)?;
    let db = Database::open(options).await?;

    let output = match &args.command {
        Command::Check => check(&db).await?,
        Command::Query { sql, params } => {
            let rows = db.all(sql, &parse_params(params)).await?;
            serde_json::Value::Array(rows.iter().map(DbRow::to_json).collect())
        }
        Command::Exec { sql, params } => {
            let res = db.run(sql, &parse_params(params)).await?;
            json!({ "changes": res.changes, "last_insert_id": res.last_insert_id })
        }
    };
    print_json(&output)?;

    if args.metrics {
        let snapshot = serde_json::to_value(db.metrics()).map_err(StoreError::other)?;
        print_json(&snapshot)?;
    }

    let closed = db.close_all().await;
    info!(closed, "connections closed");
    Ok(())
}

fn load_options(args: &Args) -> Result<StoreOptions, StoreError> {
    let mut options = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                StoreError::ConfigError(format!("cannot read {}: {e}", path.display()))
            })?;
            StoreOptions::from_json_str(&text)?
        }
        None => StoreOptions::new(args.url.clone()),
    };
    if args.read_only {
        options.read_only = true;
    }
    if let Some(ms) = args.timeout_ms {
        options.timeout_ms = ms;
    }
    options.validate()?;
    Ok(options)
}

async fn check(db: &Database) -> Result<serde_json::Value, StoreError> {
    let integrity = db.all("PRAGMA integrity_check", &[]).await?;
    let fk = db.get("PRAGMA foreign_keys", &[]).await?;
    let violations = db.all("PRAGMA foreign_key_check", &[]).await?;
    Ok(json!({
        "integrity": integrity.iter().map(DbRow::to_json).collect::<Vec<_>>(),
        "foreign_keys": fk.map(|row| row.to_json()),
        "foreign_key_violations": violations.len(),
    }))
}

fn parse_params(raw: &[String]) -> Vec<RowValues> {
    raw.iter()
        .map(|p| {
            if p.eq_ignore_ascii_case("null") {
                RowValues::Null
            } else if let Ok(i) = p.parse::<i64>() {
                RowValues::Int(i)
            } else if let Ok(f) = p.parse::<f64>() {
                RowValues::Float(f)
            } else {
                RowValues::Text(p.clone())
            }
        })
        .collect()
}

fn print_json(value: &serde_json::Value) -> Result<(), StoreError> {
    let text = serde_json::to_string_pretty(value).map_err(StoreError::other)?;
    println!("{text}");
    Ok(())
}
