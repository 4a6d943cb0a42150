use sqlx::postgres::PgQueryResult;
use sqlx::{Pool, Postgres, Transaction};

use super::statements::Statements;

pub(super) struct Migrations;

impl Migrations {
    /// Atomically sets up the event log table, its ordering indexes and the
    /// global-sequence head row. Idempotent; intended to run once per store
    /// per startup.
    pub(super) async fn run(pool: &Pool<Postgres>, statements: &Statements) -> Result<(), sqlx::Error> {
        let mut transaction: Transaction<Postgres> = pool.begin().await?;

        for migration in statements.migrations() {
            let _: PgQueryResult = sqlx::query(migration.as_str()).execute(&mut *transaction).await?;
        }

        transaction.commit().await
    }
}
