use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tracing::debug;

use crate::errors::{BoxError, CycleError};
use crate::utils::dsn::normalize_dsn;

const LIST_DATABASES: &str =
    "SELECT datname FROM pg_database WHERE datistemplate = false AND datname != 'system'";

/// Lists the databases present on the host.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self) -> Result<Vec<String>, BoxError>;
}

/// Enumerates non-template databases over a Postgres-wire connection.
#[derive(Debug, Clone)]
pub struct SystemRetriever {
    dsn: String,
}

impl SystemRetriever {
    pub fn new(dsn: &str) -> Self {
        Self {
            dsn: normalize_dsn(dsn),
        }
    }
}

#[async_trait]
impl Retriever for SystemRetriever {
    async fn retrieve(&self) -> Result<Vec<String>, BoxError> {
        let mut conn = PgConnection::connect(&self.dsn).await?;
        let names: Vec<String> = sqlx::query_scalar(LIST_DATABASES)
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;
        debug!(count = names.len(), "Fetched database list");
        Ok(names)
    }
}

/// Include/exclude policy applied to the enumerated databases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DatabaseFilter {
    #[default]
    All,
    Exclude(Vec<String>),
    Only(Vec<String>),
}

impl DatabaseFilter {
    /// `only` wins when both lists are configured.
    pub fn from_lists(only: Vec<String>, exclude: Vec<String>) -> Self {
        if !only.is_empty() {
            DatabaseFilter::Only(only)
        } else if !exclude.is_empty() {
            DatabaseFilter::Exclude(exclude)
        } else {
            DatabaseFilter::All
        }
    }

    /// Every configured name must exist in `found`, otherwise nothing is selected.
    pub fn apply(&self, found: Vec<String>) -> Result<Vec<String>, CycleError> {
        match self {
            DatabaseFilter::All => Ok(found),
            DatabaseFilter::Exclude(excluded) => {
                if let Some(missing) = excluded.iter().find(|name| !found.contains(name)) {
                    return Err(CycleError::UnknownDatabase(missing.clone()));
                }
                Ok(found
                    .into_iter()
                    .filter(|name| !excluded.contains(name))
                    .collect())
            }
            DatabaseFilter::Only(only) => {
                let mut selected: Vec<String> = Vec::with_capacity(only.len());
                for name in only {
                    if !found.contains(name) {
                        return Err(CycleError::UnknownDatabase(name.clone()));
                    }
                    if !selected.contains(name) {
                        selected.push(name.clone());
                    }
                }
                Ok(selected)
            }
        }
    }
}
