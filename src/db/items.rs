//! The logical file tree: `Item` nodes plus their per-kind descriptor rows.

use crate::error::{Error, Result};
use crate::types::{
    Item, ItemId, ItemKind, MultipartFileDescriptor, NzbFileDescriptor, RarFileDescriptor,
    RarInnerRange, RarPart, SegmentRef,
};
use sqlx::FromRow;

use super::Database;

#[derive(FromRow)]
struct ItemRow {
    id: String,
    parent_id: Option<String>,
    name: String,
    path: String,
    kind: String,
    file_size: Option<i64>,
    release_date: i64,
    is_corrupted: bool,
    corruption_reason: Option<String>,
    last_health_check: Option<i64>,
    next_health_check: Option<i64>,
}

impl ItemRow {
    fn into_item(self) -> Result<Item> {
        Ok(Item {
            id: self
                .id
                .parse()
                .map_err(|e| Error::Other(format!("corrupt item id {}: {e}", self.id)))?,
            parent_id: self
                .parent_id
                .map(|p| p.parse())
                .transpose()
                .map_err(|e| Error::Other(format!("corrupt parent_id: {e}")))?,
            name: self.name,
            path: self.path,
            kind: parse_kind(&self.kind)?,
            file_size: self.file_size,
            release_date: super::ts_to_datetime(self.release_date),
            is_corrupted: self.is_corrupted,
            corruption_reason: self.corruption_reason,
            last_health_check: self.last_health_check.map(super::ts_to_datetime),
            next_health_check: self.next_health_check.map(super::ts_to_datetime),
        })
    }
}

fn kind_str(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Directory => "directory",
        ItemKind::NzbFile => "nzb_file",
        ItemKind::RarFile => "rar_file",
        ItemKind::MultipartFile => "multipart_file",
        ItemKind::SymLink => "sym_link",
    }
}

fn parse_kind(s: &str) -> Result<ItemKind> {
    Ok(match s {
        "directory" => ItemKind::Directory,
        "nzb_file" => ItemKind::NzbFile,
        "rar_file" => ItemKind::RarFile,
        "multipart_file" => ItemKind::MultipartFile,
        "sym_link" => ItemKind::SymLink,
        other => return Err(Error::Other(format!("unknown item kind {other}"))),
    })
}

/// Everything needed to insert one file node and its descriptor in a single
/// transaction: the `Item` row plus whichever per-kind segment data applies.
pub enum NewFileDescriptor {
    /// A plain NZB-backed file.
    Nzb(Vec<SegmentRef>),
    /// An indexed (not extracted) RAR set.
    Rar {
        /// Per-volume segment lists.
        rar_parts: Vec<RarPart>,
        /// Inner-file byte-range index.
        inner_offset_map: Vec<RarInnerRange>,
    },
    /// An assembled `name.NNN` / `name.partNN.rar` multipart file.
    Multipart(Vec<RarPart>),
    /// A plain directory node; no descriptor row.
    Directory,
}

/// One node to insert as part of an import transaction.
pub struct NewItem {
    /// Stable id, generated by the caller so descriptor rows can reference it
    /// before the `Item` row itself is visible to other readers.
    pub id: ItemId,
    /// Parent directory id, or `None` for the root.
    pub parent_id: Option<ItemId>,
    /// Display name.
    pub name: String,
    /// Full `/`-joined path.
    pub path: String,
    /// Declared total size, or `None` for directories.
    pub file_size: Option<i64>,
    /// Best-effort NZB release date.
    pub release_date: chrono::DateTime<chrono::Utc>,
    /// `true` when this file is already known to be unrecoverable (e.g. an
    /// unsupported-compression RAR volume).
    pub is_corrupted: bool,
    /// Why, if `is_corrupted`.
    pub corruption_reason: Option<String>,
    /// Per-kind descriptor payload.
    pub descriptor: NewFileDescriptor,
}

impl Database {
    /// Insert an entire item tree (directories plus files) in one transaction.
    ///
    /// Called by the queue manager once per successfully imported job; a
    /// failure midway rolls back every row inserted so far, satisfying the
    /// "Item tree insert is atomic" invariant.
    pub async fn insert_item_tree(&self, items: &[NewItem]) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        for item in items {
            let kind = match &item.descriptor {
                NewFileDescriptor::Directory => ItemKind::Directory,
                NewFileDescriptor::Nzb(_) => ItemKind::NzbFile,
                NewFileDescriptor::Rar { .. } => ItemKind::RarFile,
                NewFileDescriptor::Multipart(_) => ItemKind::MultipartFile,
            };

            sqlx::query(
                "INSERT INTO items (
                    id, parent_id, name, path, kind, file_size, release_date,
                    is_corrupted, corruption_reason, last_health_check, next_health_check
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)",
            )
            .bind(item.id.to_string())
            .bind(item.parent_id.map(|p| p.to_string()))
            .bind(&item.name)
            .bind(&item.path)
            .bind(kind_str(kind))
            .bind(item.file_size)
            .bind(item.release_date.timestamp())
            .bind(item.is_corrupted)
            .bind(&item.corruption_reason)
            .execute(&mut *tx)
            .await?;

            match &item.descriptor {
                NewFileDescriptor::Directory => {}
                NewFileDescriptor::Nzb(segments) => {
                    let json = serde_json::to_string(segments)
                        .map_err(|e| Error::Other(format!("serialize segments: {e}")))?;
                    sqlx::query("INSERT INTO nzb_files (item_id, segments) VALUES (?, ?)")
                        .bind(item.id.to_string())
                        .bind(json)
                        .execute(&mut *tx)
                        .await?;
                }
                NewFileDescriptor::Rar {
                    rar_parts,
                    inner_offset_map,
                } => {
                    let parts_json = serde_json::to_string(rar_parts)
                        .map_err(|e| Error::Other(format!("serialize rar_parts: {e}")))?;
                    let map_json = serde_json::to_string(inner_offset_map)
                        .map_err(|e| Error::Other(format!("serialize inner_offset_map: {e}")))?;
                    sqlx::query(
                        "INSERT INTO rar_files (item_id, rar_parts, inner_offset_map) VALUES (?, ?, ?)",
                    )
                    .bind(item.id.to_string())
                    .bind(parts_json)
                    .bind(map_json)
                    .execute(&mut *tx)
                    .await?;
                }
                NewFileDescriptor::Multipart(parts) => {
                    let json = serde_json::to_string(parts)
                        .map_err(|e| Error::Other(format!("serialize file_parts: {e}")))?;
                    sqlx::query("INSERT INTO multipart_files (item_id, file_parts) VALUES (?, ?)")
                        .bind(item.id.to_string())
                        .bind(json)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Look up an item by its full `/`-joined path.
    pub async fn get_item(&self, path: &str) -> Result<Option<Item>> {
        let row = sqlx::query_as::<_, ItemRow>(
            "SELECT id, parent_id, name, path, kind, file_size, release_date,
                    is_corrupted, corruption_reason, last_health_check, next_health_check
             FROM items WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(self.pool())
        .await?;
        row.map(ItemRow::into_item).transpose()
    }

    /// Look up an item by id.
    pub async fn get_item_by_id(&self, id: ItemId) -> Result<Option<Item>> {
        let row = sqlx::query_as::<_, ItemRow>(
            "SELECT id, parent_id, name, path, kind, file_size, release_date,
                    is_corrupted, corruption_reason, last_health_check, next_health_check
             FROM items WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.map(ItemRow::into_item).transpose()
    }

    /// List the direct children of a directory (or the root, when `parent_id` is `None`).
    pub async fn list_children(&self, parent_id: Option<ItemId>) -> Result<Vec<Item>> {
        let rows = match parent_id {
            Some(id) => {
                sqlx::query_as::<_, ItemRow>(
                    "SELECT id, parent_id, name, path, kind, file_size, release_date,
                            is_corrupted, corruption_reason, last_health_check, next_health_check
                     FROM items WHERE parent_id = ? ORDER BY name ASC",
                )
                .bind(id.to_string())
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, ItemRow>(
                    "SELECT id, parent_id, name, path, kind, file_size, release_date,
                            is_corrupted, corruption_reason, last_health_check, next_health_check
                     FROM items WHERE parent_id IS NULL ORDER BY name ASC",
                )
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.into_iter().map(ItemRow::into_item).collect()
    }

    /// Fetch the segment list for a plain `NzbFile` item.
    pub async fn get_nzb_descriptor(&self, item_id: ItemId) -> Result<Option<NzbFileDescriptor>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT segments FROM nzb_files WHERE item_id = ?")
                .bind(item_id.to_string())
                .fetch_optional(self.pool())
                .await?;
        json.map(|j| {
            Ok(NzbFileDescriptor {
                item_id,
                segments: serde_json::from_str(&j)
                    .map_err(|e| Error::Other(format!("corrupt segments json: {e}")))?,
            })
        })
        .transpose()
    }

    /// Fetch the volume/offset index for a `RarFile` item.
    pub async fn get_rar_descriptor(&self, item_id: ItemId) -> Result<Option<RarFileDescriptor>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT rar_parts, inner_offset_map FROM rar_files WHERE item_id = ?",
        )
        .bind(item_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.map(|(parts, map)| {
            Ok(RarFileDescriptor {
                item_id,
                rar_parts: serde_json::from_str(&parts)
                    .map_err(|e| Error::Other(format!("corrupt rar_parts json: {e}")))?,
                inner_offset_map: serde_json::from_str(&map)
                    .map_err(|e| Error::Other(format!("corrupt inner_offset_map json: {e}")))?,
            })
        })
        .transpose()
    }

    /// Fetch the piece list for a `MultipartFile` item.
    pub async fn get_multipart_descriptor(
        &self,
        item_id: ItemId,
    ) -> Result<Option<MultipartFileDescriptor>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT file_parts FROM multipart_files WHERE item_id = ?")
                .bind(item_id.to_string())
                .fetch_optional(self.pool())
                .await?;
        json.map(|j| {
            Ok(MultipartFileDescriptor {
                item_id,
                file_parts: serde_json::from_str(&j)
                    .map_err(|e| Error::Other(format!("corrupt file_parts json: {e}")))?,
            })
        })
        .transpose()
    }

    /// Delete an item and (via `ON DELETE CASCADE`) its descriptor row and
    /// all descendants. Used when a job's root is removed.
    pub async fn delete_item_cascade(&self, id: ItemId) -> Result<()> {
        sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
