//! Clash-compatible external controller (Clash, mihomo).

mod client;
mod models;
mod types;

pub use client::ClashBackend;
pub use models::graph_from_proxies;
pub use types::{DelayHistory, DelayResponse, Provider, ProxiesResponse, Proxy, ProxyType};
