//! Governance Action Process Engine
//!
//! Governance action processes are graphs of steps connected by guarded links.
//! This crate stores those graphs in a metadata store, turns process
//! initiations into engine actions, runs them on cooperating engine hosts, and
//! fires successor steps from each completion's output guards. An axum API
//! exposes the same operations over HTTP.

pub mod caller;
pub mod config;
pub mod error;
pub mod governance;
pub mod models;
pub mod routes;
pub mod state;
pub mod store;

pub use config::Settings;
pub use error::{AppError, ApiResult};
pub use governance::GovernanceEngine;
pub use state::{AppState, SharedState};
pub use store::{InMemoryMetadataStore, MetadataStore, PostgresMetadataStore};
