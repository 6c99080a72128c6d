//! Platform glue shared by the Glint updater crates.
//!
//! - Per-user application directories and the files the updater keeps there.
//! - The release-manifest file name published for the running platform.

mod manifest_name;
mod paths;

pub use manifest_name::{Platform, manifest_file_name};
pub use paths::{AppPaths, AppPathsError};
