use std::sync::Arc;

use sqlx::{Pool, Postgres};

use crate::store::StoreError;

use super::migrations::Migrations;
use super::statements::Statements;
use super::{InnerPgStore, PgStore};

/// Struct used to build a brand new [`PgStore`].
pub struct PgStoreBuilder {
    pool: Pool<Postgres>,
    table_name: String,
    run_migrations: bool,
}

impl PgStoreBuilder {
    /// Creates a new instance of a [`PgStoreBuilder`] over an externally
    /// configured connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            table_name: "event_log".to_string(),
            run_migrations: true,
        }
    }

    /// Override the event log table name. Must be a plain SQL identifier.
    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = table_name.into();
        self
    }

    /// Calling this function the caller avoids running migrations. It is
    /// recommended to run migrations at least once per store per startup.
    pub fn without_running_migrations(mut self) -> Self {
        self.run_migrations = false;
        self
    }

    /// Runs the needed migrations unless explicitly disabled, then returns
    /// an instance of [`PgStore`].
    ///
    /// # Errors
    ///
    /// Will return an `Err` if running migrations fails.
    pub async fn try_build(self) -> Result<PgStore, StoreError> {
        let statements = Statements::new(&self.table_name);

        if self.run_migrations {
            Migrations::run(&self.pool, &statements).await?;
        }

        Ok(PgStore {
            inner: Arc::new(InnerPgStore { pool: self.pool, statements }),
        })
    }
}
