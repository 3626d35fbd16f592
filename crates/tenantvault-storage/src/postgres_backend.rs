//! PostgreSQL document store.
//!
//! Each namespace maps to a schema (`database`) and a table (`collection`)
//! holding one JSONB document per row. A batch is inserted inside a single
//! transaction, so it commits in full or not at all.
//!
//! Feature-gated behind `postgres-backend`. Uses `sqlx` with the Tokio
//! runtime for fully async operations.

use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::{DocumentStore, Namespace, StorageError};

/// A document store backed by PostgreSQL.
///
/// # Examples
///
/// ```no_run
/// # use tenantvault_storage::PostgresStore;
/// # #[tokio::main]
/// # async fn main() {
/// let store = PostgresStore::connect("postgres://localhost/mappings").await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

/// Quote a namespace part as a SQL identifier. Namespace parts are already
/// restricted to `[A-Za-z0-9_-]`, so no escaping is needed.
fn table_name(namespace: &Namespace) -> String {
    format!("\"{}\".\"{}\"", namespace.database(), namespace.collection())
}

impl PostgresStore {
    /// Connect to PostgreSQL.
    ///
    /// Tables are created lazily on the first write to each namespace. Reading
    /// a namespace that was never written returns no documents.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection fails. The URL is not
    /// included in the error since it usually embeds a password.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Open {
                location: "[redacted postgres url]".to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Self { pool })
    }
}

/// `undefined_table`: the namespace has never been written.
const UNDEFINED_TABLE: &str = "42P01";

fn is_undefined_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNDEFINED_TABLE))
}

#[async_trait::async_trait]
impl DocumentStore for PostgresStore {
    async fn insert_many(
        &self,
        namespace: &Namespace,
        documents: &[Value],
    ) -> Result<u64, StorageError> {
        if documents.is_empty() {
            return Ok(0);
        }

        let write_err = |e: sqlx::Error| StorageError::Write {
            namespace: namespace.to_string(),
            count: documents.len(),
            reason: e.to_string(),
        };
        let table = table_name(namespace);

        let mut tx = self.pool.begin().await.map_err(write_err)?;

        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS \"{}\"",
            namespace.database()
        ))
        .execute(&mut *tx)
        .await
        .map_err(write_err)?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                id          BIGSERIAL   PRIMARY KEY, \
                document    JSONB       NOT NULL, \
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT now()\
            )"
        ))
        .execute(&mut *tx)
        .await
        .map_err(write_err)?;

        let insert = format!("INSERT INTO {table} (document) VALUES ($1)");
        for doc in documents {
            sqlx::query(&insert)
                .bind(doc)
                .execute(&mut *tx)
                .await
                .map_err(write_err)?;
        }

        tx.commit().await.map_err(write_err)?;
        Ok(documents.len() as u64)
    }

    async fn find_all(&self, namespace: &Namespace) -> Result<Vec<Value>, StorageError> {
        let fetched: Result<Vec<(Value,)>, sqlx::Error> = sqlx::query_as(&format!(
            "SELECT document FROM {} ORDER BY id",
            table_name(namespace)
        ))
        .fetch_all(&self.pool)
        .await;

        match fetched {
            Ok(rows) => Ok(rows.into_iter().map(|(doc,)| doc).collect()),
            Err(e) if is_undefined_table(&e) => Ok(Vec::new()),
            Err(e) => Err(StorageError::Read {
                namespace: namespace.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
