//! Command-line argument parsing for embedline
//!
//! Provides clap-based CLI with subcommands and verbosity control.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// embedline - background embedding jobs and hybrid search
#[derive(Parser, Debug)]
#[command(name = "embedline")]
#[command(version)]
#[command(about = "Queue embedding jobs, run workers, and search with hybrid RRF ranking", long_about = None)]
pub struct Args {
    /// Configuration file path (default: ~/.embedline/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbosity level: -q (quiet), default (normal), -v (verbose), -vv (very verbose)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Write a default configuration and create the database
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Queue entities for embedding
    Enqueue {
        /// Entity type, e.g. DOC
        entity_type: String,

        /// One or more entity ids
        #[arg(required = true, num_args = 1..)]
        entity_ids: Vec<i64>,

        /// Lower runs first
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
    },

    /// Cancel live jobs of an entity type, or one job by id
    Cancel {
        #[arg(required_unless_present = "job", conflicts_with = "job")]
        entity_type: Option<String>,

        /// Cancel a single job
        #[arg(long)]
        job: Option<i64>,
    },

    /// Show one job, or the job history of an entity
    Status {
        /// Job id
        #[arg(required_unless_present = "entity", conflicts_with = "entity")]
        job_id: Option<i64>,

        /// Entity as TYPE:ID
        #[arg(long, value_parser = parse_entity)]
        entity: Option<(String, i64)>,
    },

    /// Job counts by status and entity type
    Stats,

    /// Hybrid keyword + semantic search
    Search {
        query: String,

        /// Entity type to search
        #[arg(short = 't', long = "type")]
        entity_type: String,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        /// Minimum cosine similarity for semantic matches (default from config)
        #[arg(long)]
        min_similarity: Option<f64>,
    },

    /// Run the worker pool until interrupted
    Run {
        /// Override the configured pool size (0 = one per CPU)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Drain eligible jobs in this process and exit
        #[arg(long)]
        once: bool,
    },

    /// Reset jobs whose lease has expired back to PENDING
    Reclaim,

    /// Delete finished jobs older than the given age
    Purge {
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },

    /// Show provider health and circuit breaker state
    Health {
        /// Call the provider's health check now
        #[arg(long)]
        check: bool,
    },
}

fn parse_entity(value: &str) -> Result<(String, i64), String> {
    let (entity_type, entity_id) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected TYPE:ID, got '{}'", value))?;
    if entity_type.is_empty() {
        return Err("entity type must not be empty".to_string());
    }
    let entity_id = entity_id
        .parse::<i64>()
        .map_err(|e| format!("invalid entity id '{}': {}", entity_id, e))?;
    Ok((entity_type.to_string(), entity_id))
}

/// Verbosity level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
    VeryVerbose,
}

impl Args {
    /// Get verbosity level based on flags
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            match self.verbose {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::VeryVerbose,
            }
        }
    }
}

impl Verbosity {
    /// Forced log filter; `None` defers to `RUST_LOG`
    pub fn log_filter(&self) -> Option<&'static str> {
        match self {
            Verbosity::Quiet => Some("error"),
            Verbosity::Normal => None,
            Verbosity::Verbose => Some("debug"),
            Verbosity::VeryVerbose => Some("trace"),
        }
    }

    /// Check if should print progress lines
    pub fn show_progress(&self) -> bool {
        !matches!(self, Verbosity::Quiet)
    }
}
