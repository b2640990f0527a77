use console::style;

use crate::recovery::RecoveryPlan;
use crate::session::{EntryReport, Feature, FeatureStatus, SessionState, StateRecord, Tier};

pub struct Display;

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_header(&self, text: &str) {
        println!();
        println!("{}", style(text).bold().cyan());
        println!("{}", style("═".repeat(60)).dim());
        println!();
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("error:").red().bold(), message);
    }

    pub fn print_entry_report(&self, report: &EntryReport) {
        self.print_header("Session entry");

        println!("Directory:  {}", style(report.directory.display()).dim());
        println!(
            "Health:     {}",
            self.health_style(report.health_status.is_broken())
                .apply_to(report.health_status.to_string())
        );
        println!(
            "State:      {} → {}",
            self.state_style(report.current_state)
                .apply_to(report.current_state.to_string()),
            self.state_style(report.next_state)
                .apply_to(report.next_state.to_string())
        );
        println!(
            "Features:   {} total, {} pending, {} completed, {} blocked",
            report.feature_status.total,
            style(report.feature_status.pending).yellow(),
            style(report.feature_status.completed).green(),
            style(report.feature_status.blocked).red()
        );

        if report.health_status.is_broken() {
            println!();
            println!(
                "{}",
                style("Environment is BROKEN. Fix it before any new feature work.")
                    .red()
                    .bold()
            );
        }

        if let Some(summary) = &report.latest_summary {
            println!();
            println!("{}", style("Last checkpoint:").bold());
            println!("  {}", style(summary).dim());
        }
        println!();
    }

    pub fn print_state(&self, record: &StateRecord, active_tier: Tier) {
        println!(
            "Session:    {}  (tier {})",
            style(&record.session_id).bold(),
            active_tier
        );
        println!(
            "State:      {}  since {}",
            self.state_style(record.state)
                .apply_to(record.state.to_string()),
            style(record.entered_at.format("%Y-%m-%d %H:%M:%S UTC")).dim()
        );
        println!(
            "Health:     {}",
            self.health_style(record.health_status.is_broken())
                .apply_to(record.health_status.to_string())
        );
        if record.needs_recovery() {
            println!(
                "{}",
                style("An interrupted procedure was detected; run `steward recover`.")
                    .yellow()
            );
        }
    }

    pub fn print_features(&self, features: &[Feature]) {
        if features.is_empty() {
            println!("{}", style("No features in the ledger.").dim());
            return;
        }
        println!();
        println!("{}", style("Features:").bold());
        for feature in features {
            let marker = self.status_marker(feature.status);
            println!("  {} {}  {}", marker, style(&feature.id).bold(), feature.title);
            if let Some(reason) = &feature.blocked_reason {
                println!("      {} {}", style("blocked:").red(), style(reason).dim());
            }
        }
        println!();
    }

    pub fn print_blocked(&self, blocked: &[&Feature]) {
        if blocked.is_empty() {
            return;
        }
        println!();
        println!(
            "{}",
            style(format!("{} blocked feature(s):", blocked.len()))
                .red()
                .bold()
        );
        for feature in blocked {
            println!(
                "  {}  {}",
                style(&feature.id).bold(),
                feature
                    .blocked_reason
                    .as_deref()
                    .unwrap_or("no reason recorded")
            );
        }
        println!();
    }

    /// Worktree entries that changed since the last commit, shown alongside
    /// the BROKEN banner so the operator sees what to inspect first.
    pub fn print_changed(&self, entries: &[String]) {
        if entries.is_empty() {
            return;
        }
        println!("{}", style("Changed since last known-good:").bold());
        for entry in entries {
            println!("  {}", style(entry).yellow());
        }
        println!();
    }

    pub fn print_recovery(&self, plan: &RecoveryPlan) {
        match plan {
            RecoveryPlan::Clean => {
                println!("{}", style("State is clean; nothing to recover.").green());
            }
            RecoveryPlan::Rerun {
                checkpoint_id,
                pending_actions,
            } => {
                println!(
                    "Rolled back to checkpoint {}.",
                    style(checkpoint_id).bold()
                );
                if !pending_actions.is_empty() {
                    println!("{}", style("Pending actions to re-run:").bold());
                    for action in pending_actions {
                        println!("  - {}", action);
                    }
                }
            }
            RecoveryPlan::RestartCurrent => {
                println!(
                    "{}",
                    style("No checkpoint found; the interrupted procedure restarts from scratch.")
                        .yellow()
                );
            }
        }
    }

    fn status_marker(&self, status: FeatureStatus) -> console::StyledObject<&'static str> {
        match status {
            FeatureStatus::Pending => style("○").dim(),
            FeatureStatus::Implemented => style("◐").yellow(),
            FeatureStatus::Tested => style("◕").cyan(),
            FeatureStatus::Completed => style("●").green(),
        }
    }

    fn state_style(&self, state: SessionState) -> console::Style {
        match state {
            SessionState::Complete => console::Style::new().green(),
            SessionState::FixBroken => console::Style::new().red(),
            SessionState::Implement | SessionState::Test => console::Style::new().cyan(),
            SessionState::Start | SessionState::Init => console::Style::new().white(),
        }
    }

    fn health_style(&self, broken: bool) -> console::Style {
        if broken {
            console::Style::new().red().bold()
        } else {
            console::Style::new().green()
        }
    }
}

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}
