//! Dependency and reverse-dependency engine
//!
//! Builds a directed graph over installed package names (plus any recipe
//! being resolved), with an edge `a -> b` when `a` depends on `b` after
//! resolving `b` against `provides` across the graph. Version predicates on
//! dependency tokens are stripped; the edge relation is by unqualified name.
//!
//! The graph answers install ordering (topological, leaves first,
//! lexicographic tie-breaks), reverse-dependency closures, and orphan
//! detection. Cycles are detected and rejected with the cycle members named.

mod cache;
mod graph;

pub use cache::{sync, GraphCache};
pub use graph::DepGraph;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Database error: {0}")]
    Db(#[from] ferrite_db::DbError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
