//! Berth Core - Core types for the release reconciler
//!
//! This crate provides the foundational types used throughout Berth:
//! - `Values`: Configuration values with deep merge and layered overrides
//! - `LoadedChart`: A chart held in memory, loaded from a directory or archive
//! - `ReleaseSpec` / `ReleaseState`: Desired and observed release state

pub mod archive;
pub mod chart;
pub mod error;
pub mod release;
pub mod sensitive;
pub mod values;

pub use chart::{ChartMetadata, Dependency, LoadedChart};
pub use error::{CoreError, Result};
pub use release::{ReleaseSpec, ReleaseState, ReleaseStatus, TrackedRelease, generate_release_id};
pub use sensitive::Sensitive;
pub use values::{
    SetListValue, SetSensitiveValue, SetValue, ValueType, Values, ValuesMerger, parse_set_values,
};
