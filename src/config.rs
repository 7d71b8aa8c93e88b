//! Configuration management
//!
//! Configuration is layered: a YAML file (optional), then `TESSERA_`-prefixed
//! environment variables, then CLI overrides applied by `main`. Env files
//! listed under `env_files` are loaded into the process environment before
//! secrets are resolved, so a value of `env:SESSION_SECRET` picks up the
//! variable from a `.env` next to the deployment.

use std::{env, path::Path};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Tuple store adapter configuration
    pub tuple_store: TupleStoreConfig,
    /// Decision cache configuration
    pub cache: CacheConfig,
    /// Session and resource token configuration
    pub tokens: TokenConfig,
    /// External identity provider configuration
    pub identity_provider: IdentityProviderConfig,
    /// API key subsystem configuration
    pub api_keys: ApiKeyConfig,
    /// Rate limiting for credential-accepting endpoints
    pub rate_limit: RateLimitConfig,
    /// Tenant the `X-Tenant-ID` header falls back to when absent
    pub default_tenant: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env_files: Vec::new(),
            server: ServerConfig::default(),
            tuple_store: TupleStoreConfig::default(),
            cache: CacheConfig::default(),
            tokens: TokenConfig::default(),
            identity_provider: IdentityProviderConfig::default(),
            api_keys: ApiKeyConfig::default(),
            rate_limit: RateLimitConfig::default(),
            default_tenant: "default".to_string(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3040,
        }
    }
}

/// Tuple store adapter mode.
///
/// The factory in `tuple::connect` selects the backend from this value; the
/// rest of the crate only ever sees the common [`crate::tuple::TupleStore`]
/// interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TupleStoreMode {
    /// One shared backend instance and a single store; tenant isolation is
    /// logical, via object namespacing.
    #[default]
    Local,
    /// Route each tenant to its own backend address derived from
    /// `namespace_template`, with a store and model per tenant.
    PerTenant,
    /// Embedded in-memory backend implementing the fixed schema. Used for
    /// development and by the test suite.
    Memory,
}

/// Tuple store adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TupleStoreConfig {
    /// Adapter mode
    pub mode: TupleStoreMode,
    /// Base URL of the tuple store backend (`local` mode), e.g.
    /// `http://fga.internal:8080`
    pub url: String,
    /// Address template for `per-tenant` mode; `{tenant}` is substituted,
    /// e.g. `http://tenant-{tenant}.fga.svc:8080`
    pub namespace_template: String,
    /// Store name to create/reuse in the backend
    pub store_name: String,
    /// Hard timeout for each backend RPC (seconds)
    pub request_timeout_secs: u64,
}

impl Default for TupleStoreConfig {
    fn default() -> Self {
        Self {
            mode: TupleStoreMode::Local,
            url: "http://127.0.0.1:8080".to_string(),
            namespace_template: "http://tenant-{tenant}.fga.svc:8080".to_string(),
            store_name: "tessera".to_string(),
            request_timeout_secs: 10,
        }
    }
}

/// Decision cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the decision cache. Every invariant holds with it disabled;
    /// it is purely an accelerator.
    pub enabled: bool,
    /// TTL for cached decisions (seconds)
    pub ttl_secs: u64,
    /// Sweep interval (seconds). 0 means "20% of TTL".
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            sweep_interval_secs: 0,
        }
    }
}

impl CacheConfig {
    /// Effective sweep interval: explicit value, or 20% of the TTL.
    #[must_use]
    pub fn effective_sweep_secs(&self) -> u64 {
        if self.sweep_interval_secs > 0 {
            self.sweep_interval_secs
        } else {
            (self.ttl_secs / 5).max(1)
        }
    }
}

/// Session and resource token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Symmetric signing secret. Supports `env:VAR_NAME` indirection.
    pub session_secret: String,
    /// Session token lifetime (seconds)
    pub session_ttl_secs: u64,
    /// Resource token lifetime (seconds). A resource token gates a single
    /// resource for the duration of a request burst; keep this short.
    pub resource_ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            session_secret: "env:TESSERA_SESSION_SECRET".to_string(),
            session_ttl_secs: 3600,
            resource_ttl_secs: 300,
        }
    }
}

impl TokenConfig {
    /// Resolve the signing secret (expand `env:VAR` indirection).
    #[must_use]
    pub fn resolve_secret(&self) -> String {
        resolve_env_indirection(&self.session_secret)
    }
}

/// External identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityProviderConfig {
    /// Expected `iss` claim of identity tokens
    pub issuer: String,
    /// JWKS endpoint. Empty derives `<issuer>/.well-known/jwks.json`.
    pub jwks_uri: String,
    /// Token endpoint for password and client-credentials grants
    pub token_endpoint: String,
    /// Accepted audiences. Empty disables the audience check.
    pub audiences: Vec<String>,
    /// JWKS cache TTL (seconds)
    pub jwks_ttl_secs: u64,
    /// Hard timeout for provider calls (seconds)
    pub request_timeout_secs: u64,
}

impl Default for IdentityProviderConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            jwks_uri: String::new(),
            token_endpoint: String::new(),
            audiences: Vec::new(),
            jwks_ttl_secs: 3600,
            request_timeout_secs: 10,
        }
    }
}

impl IdentityProviderConfig {
    /// JWKS endpoint, deriving the OIDC discovery default when unset.
    #[must_use]
    pub fn effective_jwks_uri(&self) -> String {
        if self.jwks_uri.is_empty() {
            let base = self.issuer.trim_end_matches('/');
            format!("{base}/.well-known/jwks.json")
        } else {
            self.jwks_uri.clone()
        }
    }
}

/// API key subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeyConfig {
    /// Challenge nonce lifetime (seconds)
    pub challenge_ttl_secs: u64,
    /// Challenge sweeper interval (seconds)
    pub challenge_sweep_secs: u64,
    /// Default key lifetime (seconds); 0 means keys never expire
    pub default_key_ttl_secs: u64,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: 300,
            challenge_sweep_secs: 300,
            default_key_ttl_secs: 0,
        }
    }
}

/// Rate limiting for login, key verification, and challenge issuance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable per-client-IP rate limiting on credential endpoints
    pub enabled: bool,
    /// Allowed requests per minute per client IP
    pub per_minute: u32,
    /// Burst allowance on top of the steady rate
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: 60,
            burst: 20,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (TESSERA_ prefix)
        figment = figment.merge(Env::prefixed("TESSERA_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {path_str}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {path_str}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {path_str}");
            }
        }
    }

    /// Validate configuration invariants the type system can't express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on an unusable combination.
    pub fn validate(&self) -> Result<()> {
        if self.tokens.resolve_secret().is_empty() {
            return Err(Error::Config(
                "session signing secret is not set (tokens.session_secret)".to_string(),
            ));
        }
        if self.tuple_store.mode == TupleStoreMode::PerTenant
            && !self.tuple_store.namespace_template.contains("{tenant}")
        {
            return Err(Error::Config(
                "per-tenant mode requires '{tenant}' in tuple_store.namespace_template".to_string(),
            ));
        }
        if self.default_tenant.is_empty() {
            return Err(Error::Config("default_tenant must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Expand `env:VAR_NAME` indirection; literal values pass through.
#[must_use]
pub fn resolve_env_indirection(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_default()
    } else {
        value.to_string()
    }
}
