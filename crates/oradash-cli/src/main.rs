//! oradash: command-line front end for the oradash connection core.
//!
//! Loads `oradash.toml` once, selects the mock or Oracle backend, runs one
//! operation against a configured target, and prints the result as JSON.
//!
//! # Usage
//!
//! ```text
//! oradash --config oradash.toml health --target prod
//! oradash top-sql --target prod --limit 10
//! ORADASH_MOCK=1 oradash sessions --target prod
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "oradash",
    about = "Oracle monitoring connection core",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Configuration file with runtime flags, tuning and targets.
    #[arg(short, long, default_value = "oradash.toml", global = true)]
    config: PathBuf,

    /// Use the simulated backend regardless of configuration.
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured targets (passwords omitted).
    Targets,
    /// Probe a target: reachability, version, edition, instance.
    Health {
        #[arg(short, long)]
        target: String,
    },
    /// Run one SQL statement.
    Query {
        #[arg(short, long)]
        target: String,
        /// Statement text.
        #[arg(short, long)]
        sql: String,
        /// Named input bind, `name=value`. Repeatable.
        #[arg(short, long = "bind")]
        binds: Vec<String>,
        /// Named OUT bind returned as text. Repeatable.
        #[arg(long = "out")]
        outs: Vec<String>,
        /// Deadline in seconds (default from config).
        #[arg(long)]
        timeout: Option<f64>,
        #[arg(long)]
        max_rows: Option<usize>,
        /// Leave DML uncommitted.
        #[arg(long)]
        no_commit: bool,
    },
    /// Top SQL by elapsed time.
    TopSql {
        #[arg(short, long)]
        target: String,
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// System wait events, excluding idle waits.
    Waits {
        #[arg(short, long)]
        target: String,
    },
    /// Active user sessions.
    Sessions {
        #[arg(short, long)]
        target: String,
    },
    /// Execution plan for a cursor.
    Plan {
        #[arg(short, long)]
        target: String,
        #[arg(long)]
        sql_id: String,
        #[arg(long)]
        plan_hash: Option<i64>,
    },
    /// Full text of a cached statement.
    SqlText {
        #[arg(short, long)]
        target: String,
        #[arg(long)]
        sql_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays valid JSON.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,oradash=debug")),
        )
        .init();

    let cli = Cli::parse();
    let ctx = commands::Context::load(&cli.config, cli.mock)?;

    let result = match cli.command {
        Commands::Targets => commands::targets(&ctx),
        Commands::Health { target } => commands::health(&ctx, &target).await,
        Commands::Query {
            target,
            sql,
            binds,
            outs,
            timeout,
            max_rows,
            no_commit,
        } => {
            let request = commands::query::QueryRequest {
                sql,
                binds,
                outs,
                timeout,
                max_rows,
                auto_commit: !no_commit,
            };
            commands::query::run(&ctx, &target, request).await
        }
        Commands::TopSql { target, limit } => commands::collect::top_sql(&ctx, &target, limit).await,
        Commands::Waits { target } => commands::collect::waits(&ctx, &target).await,
        Commands::Sessions { target } => commands::collect::sessions(&ctx, &target).await,
        Commands::Plan {
            target,
            sql_id,
            plan_hash,
        } => commands::collect::plan(&ctx, &target, &sql_id, plan_hash).await,
        Commands::SqlText { target, sql_id } => {
            commands::collect::sql_text(&ctx, &target, &sql_id).await
        }
    };

    ctx.shutdown().await;
    result
}
