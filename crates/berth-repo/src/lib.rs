//! Berth Chart Acquisition
//!
//! Turns a chart reference into a [`berth_core::LoadedChart`]:
//!
//! - **Local charts**: directories or `.tgz` archives on disk
//! - **HTTP repositories**: Helm-style repos with `index.yaml`
//! - **OCI registries**: exact `name:version` pulls, including index entries
//!   that redirect to `oci://`
//! - **Dependency refresh**: fetch declared dependencies into `charts/`
//!
//! ## Example
//!
//! ```rust,no_run
//! use berth_repo::{ChartResolver, ResolveOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = ChartResolver::new(ResolveOptions {
//!     repository: Some("https://charts.example.com".into()),
//!     version: Some("^1.2".into()),
//!     ..Default::default()
//! })?;
//! let chart = resolver.resolve("nginx").await?;
//! println!("{} {}", chart.name(), chart.metadata.version);
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Notes
//!
//! - Credentials are never sent after cross-origin redirects
//! - Archives with an index digest are verified with SHA256

pub mod credentials;
pub mod dependency;
pub mod error;
pub mod http;
pub mod index;
pub mod oci;
pub mod resolver;

pub use credentials::{BasicAuth, DockerConfig, ScopedCredentials, SecureHttpClient, TlsSettings};
pub use dependency::DependencyManager;
pub use error::{RepoError, Result};
pub use http::HttpRepository;
pub use index::{ChartEntry, RepositoryIndex};
pub use oci::{OciReference, Registry, RegistryClient};
pub use resolver::{ChartResolver, ChartSource, LocateOptions, ResolveOptions, is_local_reference};
