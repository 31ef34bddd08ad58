//! Removal and depclean drivers
//!
//! [`RemoveDriver`] uninstalls packages safely: protected-set policy,
//! reverse-dependency guards, manifest moved to the backup area before any
//! file is touched, optional purge of conventional state paths.
//!
//! [`DepcleanDriver`] finds orphans through the dependency graph and
//! removes them, gated by an explicit mode (`dry-run` by default).

mod depclean;
mod remove;
mod state;
mod vcs;

pub use depclean::{DepcleanDriver, DepcleanMode, DepcleanOptions};
pub use remove::{RemoveDriver, RemoveOptions};
pub use state::RemoveState;
pub use vcs::commit_ports_tree;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoveError {
    #[error("Package '{0}' is protected (use --force to override)")]
    Protected(String),

    #[error("Package '{package}' is required by: {}", .dependents.join(", "))]
    RequiredBy {
        package: String,
        dependents: Vec<String>,
    },

    #[error("Database error: {0}")]
    Db(#[from] ferrite_db::DbError),

    #[error("Graph error: {0}")]
    Graph(#[from] ferrite_graph::GraphError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
