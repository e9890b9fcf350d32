//! Import command - start tracking a release that already exists

use console::style;

use super::Session;
use crate::display;
use crate::error::{CliError, Result};

pub async fn run(session: &Session, id: &str) -> Result<()> {
    if let Some(existing) = session.state.load()? {
        return Err(CliError::config_with_help(
            format!(
                "{} already tracks release {} in namespace {}",
                session.state.path().display(),
                existing.spec.name,
                existing.spec.namespace
            ),
            "Pass a different --state file to import another release",
        ));
    }

    let imported = session.lifecycle.import(id).await?;
    display::print_warnings(&imported.warnings);
    session.state.save(&imported.release)?;

    println!(
        "{} Imported release {} at revision {}",
        style("✓").green().bold(),
        style(&imported.release.spec.name).cyan(),
        style(imported.release.state.revision).yellow()
    );
    display::print_release(&imported.release);
    Ok(())
}
