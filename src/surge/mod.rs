//! Surge HTTP API (`/v1`), polled for connections and benchmarked by policy hash.

mod client;
mod models;
mod types;

pub use client::SurgeBackend;
pub use models::graph_from_policies;
pub use types::{ActiveRequests, PolicyGroups, PolicyList, PolicyMember, SurgeRequest};
