//! Backend clients for Bazaar.
//!
//! This crate defines the two contracts the sync layer is written against
//! and provides implementations for them.
//!
//! ## Features
//!
//! - **Query client**: table select/insert/update/delete and stored procedures over REST
//! - **Change feed**: row-level change subscriptions over the realtime WebSocket
//! - **Memory backend**: in-process implementation of both, with injectable failures

mod backend;
mod config;
mod error;
pub mod memory;
pub mod realtime;
mod rest;
mod types;

pub use backend::{ChangeFeed, QueryClient};
pub use config::ClientConfig;
pub use error::{ClientError, ErrorClass};
pub use memory::{InjectedFailure, MemoryBackend, Operation};
pub use realtime::RealtimeSocket;
pub use rest::RestClient;
pub use types::*;
