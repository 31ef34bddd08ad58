//! Build pipeline for ferrite
//!
//! Turns a metafile (YAML recipe) into an installed, registered package
//! through an ordered, checkpointed stage machine:
//!
//! ```text
//! downloaded -> extracted -> patched -> built -> installed_destdir
//!            -> packaged -> deployed -> registered
//! ```
//!
//! Each transition is idempotent and guarded by the package's checkpoint
//! file, so a crashed or cancelled run resumes from the first incomplete
//! stage. The batch driver resolves the dependency closure from the ports
//! tree, orders it through the graph engine, and runs packages serially,
//! holding the chroot mounts open across bootstrap builds.

mod checkpoint;
mod commands;
mod driver;
mod extract;
mod hooks;
mod metafile;
mod package;
mod runner;

pub use checkpoint::{BuildStep, Checkpoint};
pub use commands::{interpolate, run_commands, CommandContext};
pub use driver::{BatchOptions, InstallDriver, RunSummary};
pub use extract::{extract_all, extract_archive};
pub use hooks::{HookPoint, HookRunner};
pub use metafile::{Commands, Metafile};
pub use package::{create_package, deploy_package, package_file_name};
pub use runner::{InstallOptions, StageRunner};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("No recipe for '{name}' under {ports_dir}")]
    RecipeNotFound { name: String, ports_dir: PathBuf },

    #[error("Malformed metafile {path}: {reason}")]
    Metafile { path: PathBuf, reason: String },

    #[error("Command failed after retries: {command} (exit {status})")]
    CommandFailed { command: String, status: i32 },

    #[error("Patch failed: {0}")]
    PatchFailed(String),

    #[error("Cannot extract {archive}: {reason}")]
    ExtractFailed { archive: PathBuf, reason: String },

    #[error("Dependency cycle or resolution failure: {0}")]
    Graph(#[from] ferrite_graph::GraphError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] ferrite_fetch::FetchError),

    #[error("Database error: {0}")]
    Db(#[from] ferrite_db::DbError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] ferrite_snapshot::SnapshotError),

    #[error("Chroot error: {0}")]
    Chroot(#[from] ferrite_chroot::ChrootError),

    #[error("Interrupted by signal")]
    Interrupted,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
