//! Generic external-CLI execution for framework plugins.
//!
//! Each registered framework fronts its own command-line tool
//! (`labgrid-client`, a LAVA REST client shelled out to, ...). This crate
//! knows nothing about any specific framework's vocabulary — it only knows
//! how to spawn a binary, check its exit status, and parse YAML stdout.
//! Framework-specific argument building and response shapes live in the
//! plugins themselves, in `fc-server`.

pub mod executor;

pub use executor::{CliError, CliExecutor};
