//! Gravatar Proxy Library
//!
//! Serves Gravatar avatars from a local disk cache, fetching through to
//! the upstream provider on a miss, with optional CDN delivery and purge.

pub mod cdn;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod hash;
pub mod server;
pub mod service;
pub mod types;

#[cfg(test)]
mod test_support;

pub use cdn::CdnGateway;
pub use config::{Config, Settings, SettingsHandle};
pub use error::{FetchError, ProxyError, Result};
pub use fetcher::{FetchHooks, OriginFetcher};
pub use hash::{ContentHash, HashResolver, Identifier, InMemoryUserDirectory, UserDirectory, UserRecord};
pub use server::{create_router, start_server, ServerState, SharedState};
pub use service::ProxyService;
pub use types::*;
