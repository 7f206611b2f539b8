//! Project repository: projects, their assets, and extracted asset content.
//!
//! Every read path filters soft-deleted rows (`deleted_at IS NULL`).

use std::fmt;
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{encode_json, get_json, get_parsed, now_timestamp, Database, DatabaseError};

/// Kind of ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    File,
    Url,
}

impl AssetType {
    pub const fn as_str(self) -> &'static str {
        match self {
            AssetType::File => "file",
            AssetType::Url => "url",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(AssetType::File),
            "url" => Ok(AssetType::Url),
            other => Err(DatabaseError::UnknownValue {
                kind: "asset type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_at: String,
    pub updated_at: String,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRow {
    pub id: i64,
    pub project_id: i64,
    pub filename: String,
    pub path: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub details: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl AssetRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            filename: row.get("filename")?,
            path: row.get("path")?,
            asset_type: get_parsed(row, "type")?,
            details: get_json(row, "details")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Source URL recorded for `url` assets.
    pub fn source_url(&self) -> Option<&str> {
        self.details
            .as_ref()
            .and_then(|d| d.get("url"))
            .and_then(|u| u.as_str())
    }
}

/// Fields for inserting an asset. Bytes are already stored at `path`.
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub filename: String,
    pub path: String,
    pub asset_type: AssetType,
    pub details: Option<serde_json::Value>,
}

impl NewAsset {
    pub fn file(filename: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            path: path.into(),
            asset_type: AssetType::File,
            details: None,
        }
    }

    pub fn url(filename: impl Into<String>, path: impl Into<String>, url: &str) -> Self {
        Self {
            filename: filename.into(),
            path: path.into(),
            asset_type: AssetType::Url,
            details: Some(serde_json::json!({ "url": url })),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetContentRow {
    pub id: i64,
    pub asset_id: i64,
    pub content: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl AssetContentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            asset_id: row.get("asset_id")?,
            content: row.get("content")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

// ─── Projects ───────────────────────────────────────────────────────────────

pub fn create_project(
    db: &Database,
    name: &str,
    description: &str,
) -> Result<ProjectRow, DatabaseError> {
    db.with_conn(|conn| {
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO projects (name, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![name, description, now],
        )?;
        let id = conn.last_insert_rowid();
        Ok(ProjectRow {
            id,
            name: name.to_string(),
            description: description.to_string(),
            created_at: now.clone(),
            updated_at: now,
        })
    })
}

pub fn get_project(db: &Database, project_id: i64) -> Result<Option<ProjectRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM projects WHERE id = ?1 AND deleted_at IS NULL",
                params![project_id],
                ProjectRow::from_row,
            )
            .optional()?)
    })
}

pub fn get_all_projects(db: &Database) -> Result<Vec<ProjectRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM projects WHERE deleted_at IS NULL ORDER BY id")?;
        let rows = stmt
            .query_map([], ProjectRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Soft-deletes a project together with its assets, processes and process
/// steps in one transaction. Returns `false` if no live project matched.
pub fn soft_delete_project(db: &Database, project_id: i64) -> Result<bool, DatabaseError> {
    db.with_tx(|tx| {
        let now = now_timestamp();
        let updated = tx.execute(
            "UPDATE projects SET deleted_at = ?2, updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![project_id, now],
        )?;
        if updated == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE assets SET deleted_at = ?2, updated_at = ?2
             WHERE project_id = ?1 AND deleted_at IS NULL",
            params![project_id, now],
        )?;
        tx.execute(
            "UPDATE process_steps SET deleted_at = ?2, updated_at = ?2
             WHERE deleted_at IS NULL
               AND process_id IN (SELECT id FROM processes WHERE project_id = ?1)",
            params![project_id, now],
        )?;
        tx.execute(
            "UPDATE processes SET deleted_at = ?2, updated_at = ?2
             WHERE project_id = ?1 AND deleted_at IS NULL",
            params![project_id, now],
        )?;

        log::info!("Soft-deleted project {}", project_id);
        Ok(true)
    })
}

// ─── Assets ─────────────────────────────────────────────────────────────────

pub fn create_asset(
    db: &Database,
    project_id: i64,
    asset: &NewAsset,
) -> Result<AssetRow, DatabaseError> {
    let details = encode_json("details", asset.details.as_ref())?;
    db.with_conn(|conn| {
        let now = now_timestamp();
        conn.execute(
            "INSERT INTO assets (project_id, filename, path, type, details, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                project_id,
                asset.filename,
                asset.path,
                asset.asset_type.as_str(),
                details,
                now,
            ],
        )?;
        Ok(AssetRow {
            id: conn.last_insert_rowid(),
            project_id,
            filename: asset.filename.clone(),
            path: asset.path.clone(),
            asset_type: asset.asset_type,
            details: asset.details.clone(),
            created_at: now.clone(),
            updated_at: now,
        })
    })
}

pub fn get_asset(db: &Database, asset_id: i64) -> Result<Option<AssetRow>, DatabaseError> {
    db.with_conn(|conn| find_asset(conn, asset_id))
}

pub(crate) fn find_asset(conn: &Connection, asset_id: i64) -> Result<Option<AssetRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM assets WHERE id = ?1 AND deleted_at IS NULL",
            params![asset_id],
            AssetRow::from_row,
        )
        .optional()?)
}

/// Lists a project's assets newest first, returning (rows, total_count).
pub fn list_assets(
    db: &Database,
    project_id: i64,
    limit: u64,
    offset: u64,
) -> Result<(Vec<AssetRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let total: u64 = conn.query_row(
            "SELECT COUNT(*) FROM assets WHERE project_id = ?1 AND deleted_at IS NULL",
            params![project_id],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT * FROM assets WHERE project_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(
                params![project_id, limit as i64, offset as i64],
                AssetRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

pub fn soft_delete_asset(db: &Database, asset_id: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let now = now_timestamp();
        let updated = conn.execute(
            "UPDATE assets SET deleted_at = ?2, updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![asset_id, now],
        )?;
        Ok(updated > 0)
    })
}

// ─── Asset content ──────────────────────────────────────────────────────────

/// Upserts the content row for an asset.
///
/// `Some(text)` always wins. `None` only creates a placeholder when no row
/// exists, so it never erases extracted text.
pub fn add_asset_content(
    db: &Database,
    asset_id: i64,
    content: Option<&str>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let now = now_timestamp();
        match content {
            Some(text) => conn.execute(
                "INSERT INTO asset_contents (asset_id, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(asset_id) DO UPDATE SET
                   content = excluded.content,
                   updated_at = excluded.updated_at",
                params![asset_id, text, now],
            )?,
            None => conn.execute(
                "INSERT INTO asset_contents (asset_id, content, created_at, updated_at)
                 VALUES (?1, NULL, ?2, ?2)
                 ON CONFLICT(asset_id) DO NOTHING",
                params![asset_id, now],
            )?,
        };
        Ok(())
    })
}

pub fn get_asset_content(
    db: &Database,
    asset_id: i64,
) -> Result<Option<AssetContentRow>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM asset_contents WHERE asset_id = ?1",
                params![asset_id],
                AssetContentRow::from_row,
            )
            .optional()?)
    })
}

/// Live assets of a project that have no content row at all.
pub fn get_assets_without_content(
    db: &Database,
    project_id: i64,
) -> Result<Vec<AssetRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT a.* FROM assets a
             LEFT JOIN asset_contents c ON c.asset_id = a.id
             WHERE a.project_id = ?1 AND a.deleted_at IS NULL AND c.id IS NULL
             ORDER BY a.id",
        )?;
        let rows = stmt
            .query_map(params![project_id], AssetRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Content rows of a project's live assets whose text is still null.
pub fn get_assets_content_incomplete(
    db: &Database,
    project_id: i64,
) -> Result<Vec<AssetContentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT c.* FROM asset_contents c
             JOIN assets a ON a.id = c.asset_id
             WHERE a.project_id = ?1 AND a.deleted_at IS NULL AND c.content IS NULL
             ORDER BY c.asset_id",
        )?;
        let rows = stmt
            .query_map(params![project_id], AssetContentRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn count_asset_contents(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.query_row("SELECT COUNT(*) FROM asset_contents", [], |r| r.get(0))?)
    })
}
