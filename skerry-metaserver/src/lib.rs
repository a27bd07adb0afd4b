//! Metaserver Client
//!
//! Typed HTTP client for the metaserver, the directory and authorization
//! authority of a Skerry network. Covers:
//! - the two-step nonce authorization handshake
//! - CRUD over providers, renters, files, versions, permissions,
//!   shared views, and contracts

pub mod auth;
pub mod client;

pub use auth::{AuthClient, Role};
pub use client::Client;
