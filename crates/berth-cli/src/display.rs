//! Display formatting for CLI output

use berth_core::{ReleaseStatus, TrackedRelease};
use berth_kube::Drift;
use console::{StyledObject, style};

fn status_style(status: ReleaseStatus) -> StyledObject<String> {
    let text = status.to_string();
    match status {
        ReleaseStatus::Deployed => style(text).green(),
        ReleaseStatus::Failed => style(text).red(),
        s if s.is_pending() => style(text).yellow(),
        _ => style(text).dim(),
    }
}

/// Print the tracked release the way `show` and `apply` report it
pub fn print_release(release: &TrackedRelease) {
    let spec = &release.spec;
    let state = &release.state;

    println!("{}", style("RELEASE").bold().underlined());
    println!("  Name:       {}", style(&spec.name).cyan());
    println!("  Namespace:  {}", style(&spec.namespace).yellow());
    if let Some(context) = &spec.kube_context {
        println!("  Context:    {}", context);
    }
    println!("  Revision:   {}", style(state.revision).yellow());
    println!("  Status:     {}", status_style(state.status));
    if let Some(at) = state.last_deployed {
        println!("  Deployed:   {}", at.format("%Y-%m-%d %H:%M:%S"));
    }

    println!("\n{}", style("CHART").bold().underlined());
    println!("  Reference:  {}", spec.chart);
    if let Some(repository) = &spec.repository {
        println!("  Repository: {}", repository);
    }
    println!("  Name:       {}", state.chart_name);
    println!("  Version:    {}", state.chart_version);
    if let Some(app_version) = &state.app_version {
        println!("  App:        {}", app_version);
    }

    if let Some(notes) = state.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        println!("\n{}", style("NOTES").bold().underlined());
        println!("{}", notes);
    }
}

pub fn print_drift(drift: &[Drift]) {
    if drift.is_empty() {
        println!("{} No drift detected", style("✓").green().bold());
        return;
    }
    println!("{} {} drift(s) detected:", style("⚠").yellow().bold(), drift.len());
    for d in drift {
        println!("  {} {}", style(format!("[{}]", d.kind)).yellow(), d.message);
    }
}

pub fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("{} {}", style("⚠").yellow(), warning);
    }
}
