//! Privileged helper protocol.
//!
//! A host-side helper performs operations that need an elevated identity,
//! such as provisioning a user profile. Each exchange is one connection
//! carrying one request and one response.
//!
//! Provides:
//! - `ProfileRequest` / `ProfileResponse` documents with UTF-16 JSON framing
//! - `HelperServer` answering exchanges under a combined timeout
//! - `HelperClient` issuing a single bounded request
//! - `HelperConfig` with the default channel location

pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod server;

pub use client::HelperClient;
pub use config::{HelperConfig, default_channel_path};
pub use error::HelperError;
pub use message::{BLANK_ERROR, ProfileRequest, ProfileResponse, Secret};
pub use server::{ExchangeOutcome, HelperServer, ProfileHandler, serve_exchange};
