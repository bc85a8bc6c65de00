//! embedline - CLI entry point

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use embedline::cli::{output, Args, Commands, Verbosity};
use embedline::config::Config;
use embedline::service::Pipeline;
use embedline::storage::Database;
use embedline::worker::WorkOutcome;

fn init_logging(verbosity: Verbosity, default_filter: &str) {
    let filter = match verbosity.log_filter() {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to encode JSON")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = match args.command {
        Commands::Run { .. } => "info",
        _ => "warn",
    };
    init_logging(args.verbosity(), default_filter);

    match &args.command {
        Commands::Init { force } => init(&args, *force),
        Commands::Run { workers, once } => run(&args, *workers, *once).await,
        command => {
            let config = load_config(&args)?;
            let pipeline = Pipeline::from_config(&config).context("Failed to open pipeline")?;
            dispatch(&args, command, &pipeline).await
        }
    }
}

fn init(args: &Args, force: bool) -> Result<()> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };

    let config = if path.exists() && !force {
        Config::load_from(&path)?
    } else {
        let config = Config::default();
        config.save_to(&path)?;
        config
    };

    Database::open(&config.storage.database).context("Failed to create database")?;
    std::fs::create_dir_all(&config.source.root).context("Failed to create content directory")?;

    if args.json {
        return print_json(&config);
    }
    println!("{} configuration at {}", "✓".green(), path.display());
    println!("{} database at {}", "✓".green(), config.storage.database.display());
    println!("{} content root at {}", "✓".green(), config.source.root.display());
    Ok(())
}

async fn dispatch(args: &Args, command: &Commands, pipeline: &Pipeline) -> Result<()> {
    let service = pipeline.service();

    match command {
        Commands::Enqueue {
            entity_type,
            entity_ids,
            priority,
        } => {
            let mut outcomes = Vec::with_capacity(entity_ids.len());
            for &entity_id in entity_ids {
                let outcome = service.enqueue(entity_type, entity_id, *priority)?;
                if !args.json && args.verbosity().show_progress() {
                    println!("{}", output::render_enqueued(entity_type, entity_id, &outcome));
                }
                outcomes.push(outcome);
            }
            if args.json {
                print_json(&outcomes)?;
            }
        }

        Commands::Cancel { entity_type, job } => {
            let cancelled = match (entity_type, job) {
                (_, Some(job_id)) => usize::from(service.cancel_job(*job_id)?),
                (Some(entity_type), None) => service.cancel_pending(entity_type)?,
                (None, None) => anyhow::bail!("either an entity type or --job is required"),
            };
            if args.json {
                print_json(&serde_json::json!({ "cancelled": cancelled }))?;
            } else {
                println!("Cancelled {} job(s)", cancelled);
            }
        }

        Commands::Status { job_id, entity } => match (job_id, entity) {
            (Some(job_id), _) => {
                let job = service.get_status(*job_id)?;
                if args.json {
                    print_json(&job)?;
                } else {
                    print!("{}", output::render_job(&job));
                }
            }
            (None, Some((entity_type, entity_id))) => {
                let jobs = service.history(entity_type, *entity_id)?;
                if args.json {
                    print_json(&jobs)?;
                } else {
                    print!("{}", output::render_history(&jobs));
                }
            }
            (None, None) => anyhow::bail!("either a job id or --entity is required"),
        },

        Commands::Stats => {
            let stats = service.stats()?;
            if args.json {
                print_json(&stats)?;
            } else {
                print!("{}", output::render_stats(&stats));
            }
        }

        Commands::Search {
            query,
            entity_type,
            limit,
            min_similarity,
        } => {
            let hits = service
                .search(query, entity_type, *limit, *min_similarity)
                .await?;
            if args.json {
                print_json(&hits)?;
            } else {
                print!("{}", output::render_hits(&hits));
            }
        }

        Commands::Reclaim => {
            let reclaimed = service.reclaim_orphans()?;
            if args.json {
                print_json(&serde_json::json!({ "reclaimed": reclaimed }))?;
            } else {
                println!("Reclaimed {} orphaned job(s)", reclaimed);
            }
        }

        Commands::Purge { older_than_days } => {
            let cutoff = Utc::now() - chrono::Duration::days(*older_than_days);
            let purged = service.purge_jobs(cutoff)?;
            if args.json {
                print_json(&serde_json::json!({ "purged": purged }))?;
            } else {
                println!("Purged {} finished job(s)", purged);
            }
        }

        Commands::Health { check } => {
            let health = if *check {
                service.check_provider().await
            } else {
                service.provider_health()
            };
            if args.json {
                print_json(&health)?;
            } else {
                print!("{}", output::render_health(&health));
            }
        }

        Commands::Init { .. } | Commands::Run { .. } => {}
    }

    Ok(())
}

async fn run(args: &Args, workers: Option<usize>, once: bool) -> Result<()> {
    let mut config = load_config(args)?;
    match workers {
        Some(0) => config.worker.pool_size = num_cpus::get(),
        Some(workers) => config.worker.pool_size = workers,
        None => {}
    }
    let pipeline = Pipeline::from_config(&config).context("Failed to open pipeline")?;

    if once {
        drain(&pipeline, config.lease_duration()).await?;
    } else {
        let running = pipeline.worker_pool().start().await?;
        if args.verbosity().show_progress() && !args.json {
            println!(
                "{} {} worker(s) running; press Ctrl-C to stop",
                "▶".green(),
                running.worker_ids().len()
            );
        }

        signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
        tracing::info!(target: "embedline.worker", "received shutdown signal");
        running.shutdown().await;
    }

    let stats = pipeline.service().telemetry().get_stats();
    if args.json {
        print_json(&stats)?;
    } else if args.verbosity().show_progress() {
        print!("{}", output::render_telemetry(&stats));
    }
    Ok(())
}

/// Process eligible jobs in this process until none are left or the breaker opens
async fn drain(pipeline: &Pipeline, lease: Duration) -> Result<()> {
    pipeline.service().reclaim_orphans()?;

    let worker_id = format!("{}-once-{}", pipeline.pool_config().worker_prefix, uuid::Uuid::new_v4());
    loop {
        match pipeline.processor().work_once(&worker_id, lease).await? {
            WorkOutcome::Processed { .. } => {}
            WorkOutcome::Idle => break,
            WorkOutcome::Throttled => {
                tracing::warn!(target: "embedline.worker", "provider circuit open; stopping");
                break;
            }
        }
    }
    Ok(())
}
