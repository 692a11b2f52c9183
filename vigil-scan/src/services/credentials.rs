//! Resolver credential lookup
//!
//! Resolution order: `settings` table, then `VIGIL_RESOLVER_API_KEY`, then the
//! TOML `[resolver] api_key`. The first hit is cached until `invalidate`.

use std::fmt;

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use vigil_common::Result;
use zeroize::Zeroizing;

use crate::db;

pub const RESOLVER_KEY_ENV: &str = "VIGIL_RESOLVER_API_KEY";

/// Hex characters of the secret digest kept in a credential reference
const REFERENCE_DIGEST_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Database,
    Environment,
    Config,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Database => "database",
            CredentialSource::Environment => "env",
            CredentialSource::Config => "config",
        }
    }
}

#[derive(Clone)]
pub struct Credential {
    secret: Zeroizing<String>,
    source: CredentialSource,
}

impl Credential {
    pub fn new(secret: String, source: CredentialSource) -> Self {
        Self {
            secret: Zeroizing::new(secret),
            source,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    /// Non-secret handle safe to persist alongside a scan (`source:digest-prefix`)
    pub fn reference(&self) -> String {
        let digest = format!("{:x}", Sha256::digest(self.secret.as_bytes()));
        format!("{}:{}", self.source.as_str(), &digest[..REFERENCE_DIGEST_LEN])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("source", &self.source)
            .field("secret", &"<redacted>")
            .finish()
    }
}

pub struct CredentialProvider {
    db: SqlitePool,
    config_key: Option<String>,
    cached: RwLock<Option<Credential>>,
}

impl CredentialProvider {
    pub fn new(db: SqlitePool, config_key: Option<String>) -> Self {
        Self {
            db,
            config_key,
            cached: RwLock::new(None),
        }
    }

    /// Current credential, or `None` when no source provides one
    pub async fn current(&self) -> Result<Option<Credential>> {
        if let Some(credential) = self.cached.read().await.clone() {
            return Ok(Some(credential));
        }

        let resolved = self.lookup().await?;
        if let Some(credential) = &resolved {
            tracing::debug!(source = credential.source.as_str(), "Resolver credential loaded");
            *self.cached.write().await = Some(credential.clone());
        }
        Ok(resolved)
    }

    async fn lookup(&self) -> Result<Option<Credential>> {
        if let Some(key) = db::settings::get_setting(&self.db, db::settings::RESOLVER_API_KEY).await? {
            if !key.trim().is_empty() {
                return Ok(Some(Credential::new(key, CredentialSource::Database)));
            }
        }

        if let Ok(key) = std::env::var(RESOLVER_KEY_ENV) {
            if !key.trim().is_empty() {
                return Ok(Some(Credential::new(key, CredentialSource::Environment)));
            }
        }

        Ok(self
            .config_key
            .as_ref()
            .filter(|key| !key.trim().is_empty())
            .map(|key| Credential::new(key.clone(), CredentialSource::Config)))
    }

    /// Forget the cached credential; the next call re-reads every source
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}
