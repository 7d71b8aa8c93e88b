//! Tessera — multi-tenant authentication, authorization, and key custody.
//!
//! The service answers three questions on every request: who are you, what
//! may you do, and which encrypted key material do you hold. It never sees
//! a plaintext key.
//!
//! # Subsystems
//!
//! - **Authorization** (`tuple`, `cache`, `authz`): relationship tuples in
//!   a pluggable backend, a fixed type/relation schema, a negative-aware
//!   decision cache, and tenant lifecycle.
//! - **Identity & tokens** (`identity`, `apikey`, `challenge`,
//!   `exchange`): identity-provider verification over JWKS, password/M2M
//!   login, API keys with challenge/response, session and resource-scoped
//!   token minting.
//! - **Key custody** (`kek`): versioned KEK lifecycle, per-user encrypted
//!   blob distribution, a public-key registry, and threshold recovery.
//! - **Surface** (`http`, `server`): the JSON API and the process
//!   lifecycle around it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod apikey;
pub mod authz;
pub mod cache;
pub mod challenge;
pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod http;
pub mod identity;
pub mod kek;
pub mod kv;
pub mod principal;
pub mod server;
pub mod tuple;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
