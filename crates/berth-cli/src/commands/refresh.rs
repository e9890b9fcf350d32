//! Refresh command - read the live release and report drift

use berth_kube::ReadOutcome;
use console::style;

use super::Session;
use crate::display;
use crate::error::Result;

pub async fn run(session: &Session) -> Result<()> {
    let tracked = session.state.require()?;

    match session.lifecycle.read(&tracked).await? {
        ReadOutcome::Present {
            release,
            drift,
            warnings,
        } => {
            display::print_warnings(&warnings);
            session.state.save(&release)?;
            display::print_drift(&drift);
            println!(
                "{} Release {} at revision {} ({})",
                style("✓").green().bold(),
                style(&release.spec.name).cyan(),
                style(release.state.revision).yellow(),
                release.state.status
            );
        }
        ReadOutcome::Gone => {
            session.state.remove()?;
            println!(
                "{} Release {} no longer exists in namespace {}; state removed",
                style("⚠").yellow().bold(),
                style(&tracked.spec.name).cyan(),
                style(&tracked.spec.namespace).yellow()
            );
        }
    }
    Ok(())
}
