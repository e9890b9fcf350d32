//! Berth CLI - reconcile a declared chart release against a cluster

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod display;
mod error;
mod exit_codes;
mod state;

use commands::Session;

#[derive(Parser)]
#[command(name = "berth")]
#[command(author = "Berth Contributors")]
#[command(version)]
#[command(about = "Reconcile declared chart releases against a Kubernetes cluster", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubeconfig file (defaults to $KUBECONFIG, then ~/.kube/config)
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// File holding the tracked release
    #[arg(long, global = true, env = "BERTH_STATE", default_value = state::DEFAULT_STATE_FILE)]
    state: PathBuf,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the release described by a spec, or upgrade the tracked one
    Apply {
        /// Release spec (YAML)
        spec: PathBuf,
    },

    /// Read the live release, record it and report drift
    Refresh,

    /// Uninstall the tracked release and forget it
    Destroy,

    /// Track an existing release: `context:name` or `context:namespace:name`
    Import {
        /// Import identifier
        id: String,
    },

    /// Show the tracked release
    Show {
        /// Print the rendered manifest instead
        #[arg(long)]
        manifest: bool,
    },
}

fn init_tracing(debug: bool) {
    let fallback = if debug { "berth=debug" } else { "berth=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> error::Result<()> {
    let session = Session::new(cli.kubeconfig, cli.state);
    match cli.command {
        Commands::Apply { spec } => commands::apply::run(&session, &spec).await,
        Commands::Refresh => commands::refresh::run(&session).await,
        Commands::Destroy => commands::destroy::run(&session).await,
        Commands::Import { id } => commands::import::run(&session, &id).await,
        Commands::Show { manifest } => commands::show::run(&session, manifest),
    }
}

#[tokio::main]
async fn main() {
    // Setup miette for nice error display
    miette::set_panic_hook();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(exit_codes::USAGE_ERROR);
        }
        Err(e) => e.exit(),
    };

    init_tracing(cli.debug);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}
