use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use steward::cli::{Cli, Commands, Display};
use steward::config::{ProjectConfig, SessionPaths};
use steward::error::Result;
use steward::health::HealthProbe;
use steward::session::{BacklogSource, MutationGuard, SessionController, TierGate};
use steward::workspace::{GitWorkspaceCheck, WorkspaceCheck};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            Display::new().print_error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("steward=debug")
    } else {
        EnvFilter::new("steward=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let display = Display::new();
    let root = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let paths = SessionPaths::new(&root);

    let config = ProjectConfig::load(paths.project_config_file()).await?;
    let probe = Arc::new(HealthProbe::from_config(&config, root.clone()));
    let workspace = Arc::new(GitWorkspaceCheck::new(root.clone()));
    let guard = MutationGuard::new().with_workspace_check(workspace.clone());

    let mut controller = SessionController::open(paths.clone(), probe)
        .await?
        .with_guard(guard);

    match cli.command {
        Commands::Entry => {
            let report = controller.entry().await?;
            display.print_entry_report(&report);
            if report.health_status.is_broken() {
                display.print_changed(&workspace.uncommitted().await?);
            }
        }
        Commands::Mark { id, status } => {
            controller.mark_feature(&id, status.into()).await?;
            let feature = controller.ledger().get(&id);
            if let Some(feature) = feature {
                display.print_features(std::slice::from_ref(feature));
            }
        }
        Commands::Checkpoint { summary } => {
            controller.checkpoint(summary).await?;
            println!("Checkpoint written.");
        }
        Commands::Recover => {
            let plan = controller.recover_now().await?;
            display.print_recovery(&plan);
        }
        Commands::Status => {
            display.print_state(controller.record(), controller.active_tier());
            display.print_features(controller.ledger().features());
            let blocked = controller.ledger().blocked_features(controller.active_tier());
            display.print_blocked(&blocked);
        }
        Commands::Expand => {
            let source = Arc::new(BacklogSource::new(paths.backlog_file()));
            let gate = TierGate::new(source);
            let (tier, added) = controller.expand_tier(&gate).await?;
            println!("Expanded to tier {} ({} new feature(s)).", tier, added);
        }
    }

    Ok(())
}
