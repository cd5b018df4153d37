//! Batata Apollo Client - Rust SDK for Apollo-compatible config services
//!
//! This crate provides:
//! - Config sync over the Apollo HTTP protocol, by long poll or periodic bulk refresh
//! - Replica discovery with round-robin failover across config service nodes
//! - Per-namespace caches with change diffs and typed accessors
//! - Change listeners, including regex-keyed routing of single keys
//! - Local backup snapshots used when the config service is unreachable
//! - Optional HMAC request signing

pub mod auth;
pub mod backup;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod listener;
pub mod model;
pub mod parser;
pub mod remote;

// Client re-exports
pub use client::{ApolloClient, ApolloClientBuilder};
pub use config::{AppIdentity, ClientConfig, SyncMode};
pub use error::{ClientError, Result};
pub use model::*;

// Cache and listener re-exports
pub use cache::store::{CacheStore, MemoryStore};
pub use cache::{ConfigCache, NamespaceCache};
pub use listener::router::{FnKeyChangeListener, KeyChangeListener, KeyRouter};
pub use listener::{
    ChangeEvent, ChangeListener, ChangeType, ConfigChange, FnChangeListener, FullChangeEvent,
};

// Pluggable parts
pub use auth::{AuthHook, HmacAuthHook};
pub use backup::{BackupStore, FileBackupStore};
pub use parser::{ContentParser, ParserRegistry};
pub use remote::server::{ServerInfo, ServerRegistry};
