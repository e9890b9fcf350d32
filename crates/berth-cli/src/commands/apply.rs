//! Apply command - install a release, or upgrade the tracked one

use berth_core::ReleaseSpec;
use console::style;
use std::path::Path;

use super::Session;
use crate::display;
use crate::error::{CliError, Result};

fn load_spec(path: &Path) -> Result<ReleaseSpec> {
    let content = std::fs::read_to_string(path).map_err(|e| CliError::io_at(path, e))?;
    ReleaseSpec::from_yaml(&content).map_err(|e| {
        CliError::config_with_help(
            format!("{}: {}", path.display(), e),
            "A release spec needs at least `name`, `namespace` and `chart`",
        )
    })
}

/// Run the apply command
pub async fn run(session: &Session, spec_path: &Path) -> Result<()> {
    let spec = load_spec(spec_path)?;

    let release = match session.state.load()? {
        None => {
            println!(
                "{} Installing release {} in namespace {}",
                style("→").blue().bold(),
                style(&spec.name).cyan(),
                style(&spec.namespace).yellow()
            );
            session.lifecycle.create(&spec).await?
        }
        Some(prior) => {
            println!(
                "{} Upgrading release {} (tracked revision {})",
                style("→").blue().bold(),
                style(&spec.name).cyan(),
                style(prior.state.revision).yellow()
            );
            session.lifecycle.update(&spec, &prior).await?
        }
    };

    session.state.save(&release)?;
    println!(
        "{} Release {} is {} at revision {}",
        style("✓").green().bold(),
        style(&release.spec.name).cyan(),
        release.state.status,
        style(release.state.revision).yellow()
    );
    display::print_release(&release);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_spec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("release.yaml");
        std::fs::write(
            &path,
            "name: web\nnamespace: apps\nchart: ./charts/web\nset:\n  - name: replicaCount\n    value: \"3\"\n",
        )
        .unwrap();

        let spec = load_spec(&path).unwrap();
        assert_eq!(spec.name, "web");
        assert_eq!(spec.set.len(), 1);
    }

    #[test]
    fn test_load_spec_invalid_yaml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("release.yaml");
        std::fs::write(&path, "name: [web\n").unwrap();
        assert!(matches!(load_spec(&path), Err(CliError::Config { .. })));
    }

    #[test]
    fn test_load_spec_missing_file() {
        let err = load_spec(Path::new("/nonexistent/release.yaml")).unwrap_err();
        assert!(matches!(err, CliError::Io { .. }));
    }
}
