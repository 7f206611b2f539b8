//! Credential repository: the single shared extraction API key.

use rusqlite::{params, OptionalExtension};

use super::{now_timestamp, Database, DatabaseError};

/// Returns the deployment's API key, if one has been stored.
pub fn get_api_key(db: &Database) -> Result<Option<String>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT key FROM api_keys ORDER BY id DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?)
    })
}

/// Stores the API key, replacing any previous one.
pub fn set_api_key(db: &Database, key: &str) -> Result<(), DatabaseError> {
    db.with_tx(|tx| {
        let now = now_timestamp();
        tx.execute("DELETE FROM api_keys", [])?;
        tx.execute(
            "INSERT INTO api_keys (key, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![key, now],
        )?;
        Ok(())
    })
}
