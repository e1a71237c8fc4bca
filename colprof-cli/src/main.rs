use clap::{Parser, Subcommand};
use colprof_cli::{ColumnSpec, HttpTransport, TableProfiler};
use colprof_core::batcher::BatchQueue;
use colprof_core::{priority_of, ColumnQuery, QueueConfig};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "colprof")]
#[command(version)]
#[command(about = "Prioritized, batched column profiling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the rank each profiling query is queued with
    Policy {
        /// Only show ranks for the active column
        #[arg(long)]
        active: bool,
    },

    /// Profile the columns of a table
    Profile {
        /// Runtime base URL
        #[arg(long, default_value = "http://localhost:9009")]
        runtime_url: String,

        /// Runtime instance the queries run against
        #[arg(long, default_value = "default")]
        instance: String,

        /// Table to profile
        #[arg(short, long)]
        table: String,

        /// Columns as name or name:kind (numeric, categorical, timestamp)
        #[arg(short, long, value_delimiter = ',', required = true)]
        columns: Vec<ColumnSpec>,

        /// Column the user is looking at; profiled first
        #[arg(long)]
        active: Option<String>,

        /// Maximum batches in flight (default: COLPROF_CONCURRENCY_LIMIT or 5)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Output file for the profile (JSON)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays parseable
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("colprof=info,colprof_cli=info,colprof_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Policy { active } => {
            println!("=== Query Ranks ===");
            println!("{:<24} {:>6} {:>8} {:>12}", "query", "cost", "active", "background");

            let mut ranks = Vec::new();
            for query in ColumnQuery::ALL {
                let active_rank = priority_of(query, true);
                let background_rank = priority_of(query, false);
                if active {
                    println!("{:<24} {:>6} {:>8}", query, query.cost(), active_rank);
                    ranks.push(json!({ "query": query, "rank": active_rank }));
                } else {
                    println!(
                        "{:<24} {:>6} {:>8} {:>12}",
                        query,
                        query.cost(),
                        active_rank,
                        background_rank
                    );
                    ranks.push(json!({
                        "query": query,
                        "active": active_rank,
                        "background": background_rank,
                    }));
                }
            }
            println!();

            println!("=== JSON Output ===");
            println!("{}", serde_json::to_string_pretty(&ranks)?);
        }

        Commands::Profile {
            runtime_url,
            instance,
            table,
            columns,
            active,
            concurrency,
            output,
        } => {
            let mut config = QueueConfig::from_env();
            if let Some(limit) = concurrency {
                config.concurrency_limit = limit;
            }

            let transport = HttpTransport::new(&runtime_url);
            if let Err(e) = transport.health_check().await {
                warn!(error = %e, "Runtime health check failed, profiling anyway");
            }

            info!(
                table = %table,
                columns = columns.len(),
                concurrency = config.concurrency_limit,
                "Starting profile"
            );

            let queue = BatchQueue::new(config, transport);
            let profiler = TableProfiler::new(queue.clone(), instance, table, columns);
            profiler.set_active_column(active.as_deref());

            let profile = {
                let run = profiler.profile();
                tokio::pin!(run);
                tokio::select! {
                    profile = &mut run => profile,
                    _ = tokio::signal::ctrl_c() => {
                        warn!("Interrupted, cancelling outstanding queries");
                        profiler.leave();
                        run.await
                    }
                }
            };

            println!("=== Profile: {} ===", profile.table);
            for column in &profile.columns {
                println!(
                    "{} ({}): {} stats, {} errors{}",
                    column.column,
                    column.kind,
                    column.stats.len(),
                    column.errors.len(),
                    if column.cancelled { ", cancelled" } else { "" }
                );
            }
            println!();

            let metrics = queue.metrics().snapshot();
            println!("=== Queue ===");
            println!("Batches sent: {}", metrics.batches_sent);
            println!("Avg batch size: {:.1}", metrics.avg_batch_size);
            println!("Avg queue wait: {:.1}ms", metrics.avg_queue_wait_ms);
            println!("Failed: {}", metrics.requests_failed);
            println!();

            let json = serde_json::to_string_pretty(&profile)?;
            if let Some(path) = output {
                std::fs::write(&path, &json)?;
                println!("Profile saved to: {}", path);
            } else {
                println!("=== JSON Output ===");
                println!("{}", json);
            }
        }
    }

    Ok(())
}
