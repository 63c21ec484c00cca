//! Standard exit codes for CLI operations
//!
//! These exit codes follow Unix conventions and sysexits.h where applicable.

/// General error - unspecified failure
pub const ERROR: i32 = 1;

/// Validation error - invalid bundle, parameter or claim name
pub const VALIDATION_ERROR: i32 = 2;

/// Action error - the invocation image ran and failed
pub const ACTION_FAILED: i32 = 3;

/// Storage error - the claim store could not be read or written
pub const STORAGE_ERROR: i32 = 4;

/// IO error - file not found, permission denied, etc.
pub const IO_ERROR: i32 = 5;

/// Not found - no claim with the given name
pub const NOT_FOUND: i32 = 6;

/// Credentials error - a credential could not be resolved or is missing
pub const CREDENTIALS_ERROR: i32 = 7;

/// Driver error - unknown driver or unsupported invocation image
pub const DRIVER_ERROR: i32 = 8;

/// Usage error - invalid arguments or options (following sysexits.h convention)
pub const USAGE_ERROR: i32 = 64;
