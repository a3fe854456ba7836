use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{ConnectOptions, SqliteConnection};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqliteQuerySnafu, SqliteRuntimeInitSnafu,
    SqliteThreadSpawnSnafu, StorageResult,
};
use super::kv::KeyValueStore;
use super::types::unix_timestamp_seconds;

/// Key-value entries in a single SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteKeyValueStore {
    database_url: String,
}

impl SqliteKeyValueStore {
    /// Opens (creating if needed) the database file and applies migrations.
    pub fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let store = Self {
            database_url: normalize_database_url(database_location),
        };

        let database_url = store.database_url.clone();
        store.run_db_call("sqlite-open", async move {
            let options = store_connect_options(&database_url, "sqlite-open-options")?;
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .context(SqliteConnectSnafu {
                    stage: "sqlite-open-connect",
                    database_url: database_url.clone(),
                })?;

            let migrated = sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context(SqliteMigrateSnafu {
                    stage: "sqlite-open-migrate",
                });
            pool.close().await;
            migrated
        })?;

        tracing::debug!(database_url = %store.database_url, "opened sqlite key-value store");
        Ok(store)
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // The store trait is sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let database_url = self.database_url.clone();
        let key = key.to_string();
        self.run_db_call("kv-get", async move {
            let mut connection = connect_store_connection(&database_url, "kv-get-connect").await?;
            sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "kv-get-query",
                })
        })
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.run_db_call("kv-set", async move {
            let mut connection = connect_store_connection(&database_url, "kv-set-connect").await?;
            let now = i64::try_from(unix_timestamp_seconds()).unwrap_or(i64::MAX);
            sqlx::query(
                "INSERT INTO kv_entries (key, value, updated_at) VALUES (?, ?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(now)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "kv-set-upsert",
            })?;
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        let key = key.to_string();
        self.run_db_call("kv-remove", async move {
            let mut connection = connect_store_connection(&database_url, "kv-remove-connect").await?;
            sqlx::query("DELETE FROM kv_entries WHERE key = ?")
                .bind(key)
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "kv-remove-delete",
                })?;
            Ok(())
        })
    }
}

fn store_connect_options(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnectOptions> {
    let options = SqliteConnectOptions::from_str(database_url)
        .context(SqliteConnectOptionsSnafu {
            stage,
            database_url: database_url.to_string(),
        })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5_000));
    Ok(options)
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let options = store_connect_options(database_url, stage)?;
    options.connect().await.context(SqliteConnectSnafu {
        stage,
        database_url: database_url.to_string(),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_locations_normalize_to_sqlite_urls() {
        assert_eq!(
            normalize_database_url("/tmp/ikiganiro/chat.db"),
            "sqlite:///tmp/ikiganiro/chat.db"
        );
        assert_eq!(normalize_database_url("sqlite://x.db"), "sqlite://x.db");
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let location = dir.path().join("db").join("chat.db");
        let location = location.to_string_lossy().to_string();

        let store = SqliteKeyValueStore::open(&location).expect("store opens");
        assert_eq!(store.get("ikiganiro.chat_sessions").expect("get works"), None);
        store
            .set("ikiganiro.chat_sessions", "[]")
            .expect("insert works");
        store
            .set("ikiganiro.chat_sessions", "[{}]")
            .expect("upsert works");

        let reopened = SqliteKeyValueStore::open(&location).expect("store reopens");
        assert_eq!(
            reopened.get("ikiganiro.chat_sessions").expect("get works"),
            Some("[{}]".to_string())
        );

        reopened
            .remove("ikiganiro.chat_sessions")
            .expect("delete works");
        assert_eq!(reopened.get("ikiganiro.chat_sessions").expect("get works"), None);
    }
}
