use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::session::FeatureStatus;

#[derive(Parser)]
#[command(name = "steward")]
#[command(author, version, about = "Session state and recovery steward for agent workspaces", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Session directory (default: current directory)
    #[arg(long, global = true, env = "STEWARD_DIR")]
    pub dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the entry protocol and report the next state
    Entry,

    /// Advance a feature one status step
    Mark {
        /// Feature ID
        id: String,

        /// Target status
        #[arg(value_enum)]
        status: StatusArg,
    },

    /// Write a checkpoint of the current session state
    Checkpoint {
        /// One-line summary of what is in flight
        #[arg(short, long, default_value = "manual checkpoint")]
        summary: String,
    },

    /// Roll back to the last durable state if a procedure was interrupted
    Recover,

    /// Show session state, health, and the feature ledger
    Status,

    /// Promote the session to the next feature tier
    Expand,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum StatusArg {
    Pending,
    Implemented,
    Tested,
    Completed,
}

impl From<StatusArg> for FeatureStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => FeatureStatus::Pending,
            StatusArg::Implemented => FeatureStatus::Implemented,
            StatusArg::Tested => FeatureStatus::Tested,
            StatusArg::Completed => FeatureStatus::Completed,
        }
    }
}
