//! Standard exit codes for CLI operations
//!
//! These exit codes follow Unix conventions and sysexits.h where applicable.

/// General error - unspecified failure
pub const ERROR: i32 = 1;

/// Configuration error - invalid spec, overrides or import ID
pub const CONFIG_ERROR: i32 = 2;

/// Resolution error - the chart could not be located or downloaded
pub const RESOLUTION_ERROR: i32 = 3;

/// Operation error - install, upgrade or uninstall failed on the cluster
pub const OPERATION_ERROR: i32 = 4;

/// IO error - spec or state file unreadable or unwritable
pub const IO_ERROR: i32 = 5;

/// Authentication error - the cluster rejected the credentials
pub const AUTH_ERROR: i32 = 6;

/// Usage error - invalid arguments or options (following sysexits.h convention)
pub const USAGE_ERROR: i32 = 64;
