//! Provider Block Transport
//!
//! Clients for the provider block service: an authenticated blob store
//! addressed by `/blocks/<block_id>?renterID=<renter_id>`. The transport
//! moves raw bytes and verifies neither size nor hash; integrity
//! checking belongs to the download pipeline.

pub mod client;

pub use client::{BlockStore, HttpBlockStore};
