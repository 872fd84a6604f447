//! Database access layer for reverse-logistics requests.
//!
//! The repository translates between the domain model and the `requests`
//! table. All SQL touching requests lives here; higher layers go through
//! `Storage` or a trait built on top of it.

use std::sync::Arc;

use sqlx::PgPool;

pub mod requests;

use crate::error::Result;

/// Container for repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for request operations.
    pub requests: Arc<requests::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self { requests: Arc::new(requests::Repository::new(pool)) }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.requests.pool()).await?;

        Ok(())
    }
}
