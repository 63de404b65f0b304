//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - seed: register the corpus's pairs
//! - provision: create the eligibility tokens
//! - run: allocate and publish one wave
//! - reconcile: credit submitted work
//! - status: wave and task progress
//! - screening: generate a screening test

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Wavecrowd - wave scheduler for crowd pair annotation
#[derive(Parser, Debug)]
#[command(name = "wavecrowd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Observe the corpus, rank its groups and register their pairs
    Seed {
        /// Directory of per-document JSON records (overrides config)
        #[arg(short, long)]
        documents: Option<PathBuf>,

        /// Groups file, one group per line (overrides config)
        #[arg(short, long)]
        groups: Option<PathBuf>,
    },

    /// Create the three eligibility qualification types
    Provision,

    /// Allocate and publish the next wave
    Run {
        /// Print the planned wave without calling the marketplace
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Poll the marketplace and credit submitted assignments
    Reconcile,

    /// Show wave and task progress
    Status {
        /// Number of recent events to show
        #[arg(short, long, default_value_t = 10)]
        events: usize,
    },

    /// Generate a screening test from a question pool
    Screening {
        /// Question pool (TSV: question, answer, type; first line is a header)
        #[arg(long)]
        questions: PathBuf,

        /// Where to write the question form
        #[arg(long)]
        out_questions: PathBuf,

        /// Where to write the answer key
        #[arg(long)]
        out_answers: PathBuf,

        /// Number of questions to sample
        #[arg(short = 'n', default_value_t = 7)]
        count: usize,

        /// Seed for reproducible sampling
        #[arg(long)]
        seed: Option<u64>,
    },
}
