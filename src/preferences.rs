use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Preference key of the application selected last.
pub const DEFAULT_APPLICATION_KEY: &str = "default_application";

/// Durable user preferences, kept across panel sessions.
pub trait PreferenceStore: Send + Sync {
    /// Reads a preference value.
    fn get(&self, key: &str) -> Result<Option<String>, PreferenceError>;

    /// Writes a preference value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<(), PreferenceError>;

    /// The application selected last, if any.
    fn default_application(&self) -> Result<Option<String>, PreferenceError> {
        Ok(self
            .get(DEFAULT_APPLICATION_KEY)?
            .filter(|name| !name.trim().is_empty()))
    }

    /// Remembers the selected application.
    fn set_default_application(&self, name: &str) -> Result<(), PreferenceError> {
        self.set(DEFAULT_APPLICATION_KEY, name)
    }
}

/// Errors that can occur when reading or writing preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreferenceError {
    /// The backing storage failed
    Storage(String),
}

impl std::fmt::Display for PreferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreferenceError::Storage(msg) => write!(f, "Preference storage error: {}", msg),
        }
    }
}

impl std::error::Error for PreferenceError {}

impl From<rusqlite::Error> for PreferenceError {
    fn from(err: rusqlite::Error) -> Self {
        PreferenceError::Storage(format!("SQL error: {}", err))
    }
}

/// SQLite-backed preference store.
///
/// Creates its schema on first use. The connection is guarded by a mutex
/// because SQLite connections are not thread-safe.
#[derive(Debug)]
pub struct SqlitePreferenceStore {
    conn: Mutex<Connection>,
}

impl SqlitePreferenceStore {
    /// Opens (or creates) a file-based preference database.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    /// Creates a preference store backed by an in-memory database.
    pub fn new_in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> SqliteResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(SqlitePreferenceStore {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>, PreferenceError> {
        self.conn
            .lock()
            .map_err(|_| PreferenceError::Storage("connection lock poisoned".to_string()))
    }

    /// When a preference was last written.
    pub fn updated_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, PreferenceError> {
        let conn = self.connection()?;
        let updated_at = conn
            .query_row(
                "SELECT updated_at FROM preferences WHERE key = ?1",
                [key],
                |row| row.get::<_, DateTime<Utc>>(0),
            )
            .optional()?;
        Ok(updated_at)
    }
}

impl PreferenceStore for SqlitePreferenceStore {
    fn get(&self, key: &str) -> Result<Option<String>, PreferenceError> {
        let conn = self.connection()?;
        let value = conn
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PreferenceError> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now()],
        )?;
        Ok(())
    }
}

/// In-memory preference store for testing.
#[derive(Debug, Default)]
pub struct InMemoryPreferenceStore {
    values: Mutex<HashMap<String, String>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already remembers `application`.
    pub fn with_default_application(application: &str) -> Self {
        let store = Self::new();
        if let Ok(mut values) = store.values.lock() {
            values.insert(DEFAULT_APPLICATION_KEY.to_string(), application.to_string());
        }
        store
    }
}

impl PreferenceStore for InMemoryPreferenceStore {
    fn get(&self, key: &str) -> Result<Option<String>, PreferenceError> {
        let values = self
            .values
            .lock()
            .map_err(|_| PreferenceError::Storage("lock poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PreferenceError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| PreferenceError::Storage("lock poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
