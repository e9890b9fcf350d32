//! Show command - print the tracked release without contacting the cluster

use super::Session;
use crate::display;
use crate::error::Result;

pub fn run(session: &Session, manifest: bool) -> Result<()> {
    let release = session.state.require()?;
    if manifest {
        println!("{}", release.state.manifest.expose());
        return Ok(());
    }
    display::print_release(&release);
    Ok(())
}
