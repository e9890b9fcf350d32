//! Destroy command - uninstall the tracked release

use console::style;

use super::Session;
use crate::error::Result;

pub async fn run(session: &Session) -> Result<()> {
    let tracked = session.state.require()?;
    println!(
        "{} Uninstalling release {} from namespace {}",
        style("→").blue().bold(),
        style(&tracked.spec.name).cyan(),
        style(&tracked.spec.namespace).yellow()
    );

    // A failed uninstall keeps the state so the release stays tracked
    session.lifecycle.delete(&tracked).await?;
    session.state.remove()?;

    println!(
        "{} Release {} uninstalled",
        style("✓").green().bold(),
        style(&tracked.spec.name).cyan()
    );
    Ok(())
}
