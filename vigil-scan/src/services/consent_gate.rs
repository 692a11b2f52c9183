//! Consent Gate
//!
//! Missing consent record fails open (allowed, with a warning); an explicit
//! `false` denies.

use sqlx::SqlitePool;

use crate::db;
use crate::error::ScanResult;

#[derive(Clone)]
pub struct ConsentGate {
    db: SqlitePool,
}

impl ConsentGate {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn is_allowed(&self, account_id: &str) -> ScanResult<bool> {
        match db::consent::get_consent(&self.db, account_id).await? {
            Some(allowed) => Ok(allowed),
            None => {
                tracing::warn!(account_id, "No consent record, allowing scan");
                Ok(true)
            }
        }
    }
}
