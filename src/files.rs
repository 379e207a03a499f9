//! File lifecycle rules tied directly to the Run/File data-model invariants.
//!
//! Uploads and file-browser CRUD belong to the external blob store and API
//! facade; what stays in the core is the part that cannot be implemented
//! correctly anywhere else because it depends on the Run/File rows this
//! crate owns: deleting a Run's unsaved files when the Run is deleted, and
//! checking a caller-supplied quota against the totals this crate's own
//! tables hold before a new File row is admitted.

use crate::db::Db;
use crate::errors::QuotaError;
use crate::types::{File, Principal};
use rusqlite::{OptionalExtension, params};

/// A caller-supplied quota, resolved by the Identity service external to
/// this crate and passed in rather than stored here.
#[derive(Debug, Clone, Copy)]
pub struct Quota {
    pub max_storage_bytes: u64,
    pub max_files: u64,
}

/// Check `quota` against a principal's current usage before admitting
/// `added_bytes`/one more file. Fails without any side effect.
pub async fn check_quota(
    db: &Db,
    owner_id: &str,
    quota: Quota,
    added_bytes: u64,
) -> anyhow::Result<Result<(), QuotaError>> {
    let owner = owner_id.to_string();
    let (used_bytes, used_files): (i64, i64) = db
        .with_conn(move |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(size), 0), COUNT(*) FROM file WHERE owner_id = ?1",
                params![owner],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
        })
        .await?;

    let used_bytes = used_bytes as u64;
    let used_files = used_files as u64;

    if used_bytes + added_bytes > quota.max_storage_bytes {
        return Ok(Err(QuotaError::StorageExceeded {
            added: added_bytes,
            limit: quota.max_storage_bytes,
        }));
    }
    if used_files + 1 > quota.max_files {
        return Ok(Err(QuotaError::FileCountExceeded {
            added: 1,
            limit: quota.max_files,
        }));
    }
    Ok(Ok(()))
}

/// Delete a Run and everything the Run exclusively owns.
///
/// Files with `saved=false` are the Run's custodial property and are
/// deleted along with their blobs. Files with
/// `saved=true` survive and are detached (`run_id` cleared, invariant 4).
/// Rejects callers who neither own the Run nor are admins.
pub async fn delete_run(db: &Db, run_id: &str, principal: Principal<'_>) -> anyhow::Result<()> {
    let run_id_owned = run_id.to_string();
    let owner: Option<String> = db
        .with_conn({
            let run_id = run_id_owned.clone();
            move |conn| {
                conn.query_row(
                    "SELECT owner_id FROM run WHERE id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()
            }
        })
        .await?;
    let Some(owner) = owner else {
        anyhow::bail!("run {run_id} not found");
    };
    if owner != principal.id && !principal.is_admin {
        anyhow::bail!("principal does not own run {run_id}");
    }

    let unsaved_locations: Vec<String> = db
        .with_conn({
            let run_id = run_id_owned.clone();
            move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT location FROM file WHERE run_id = ?1 AND saved = 0",
                )?;
                let rows = stmt.query_map(params![run_id], |row| row.get(0))?;
                rows.collect()
            }
        })
        .await?;

    for location in unsaved_locations {
        let _ = tokio::fs::remove_file(&location).await;
    }

    db.with_conn({
        let run_id = run_id_owned.clone();
        move |conn| {
            conn.execute(
                "DELETE FROM file WHERE run_id = ?1 AND saved = 0",
                params![run_id],
            )
        }
    })
    .await?;

    db.with_conn({
        let run_id = run_id_owned.clone();
        move |conn| {
            conn.execute(
                "UPDATE file SET run_id = NULL WHERE run_id = ?1",
                params![run_id],
            )
        }
    })
    .await?;

    db.with_conn(move |conn| {
        conn.execute("DELETE FROM run WHERE id = ?1", params![run_id_owned])
    })
    .await?;

    Ok(())
}

/// Mark a File `saved`, exempting it from future Run-deletion cascades.
/// Rejects non-owners/non-admins.
pub async fn set_saved(
    db: &Db,
    file_id: &str,
    saved: bool,
    principal: Principal<'_>,
) -> anyhow::Result<()> {
    let file_id_owned = file_id.to_string();
    let owner: Option<String> = db
        .with_conn({
            let file_id = file_id_owned.clone();
            move |conn| {
                conn.query_row(
                    "SELECT owner_id FROM file WHERE id = ?1",
                    params![file_id],
                    |row| row.get(0),
                )
                .optional()
            }
        })
        .await?;
    let Some(owner) = owner else {
        anyhow::bail!("file {file_id} not found");
    };
    if owner != principal.id && !principal.is_admin {
        anyhow::bail!("principal does not own file {file_id}");
    }
    db.with_conn(move |conn| {
        conn.execute(
            "UPDATE file SET saved = ?1 WHERE id = ?2",
            params![saved, file_id_owned],
        )
    })
    .await?;
    Ok(())
}

pub(crate) async fn insert_owned_file(db: &Db, file: &File) -> anyhow::Result<()> {
    let file = file.clone();
    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO file (id, name, file_type, size, location, owner_id, run_id, saved, parent_id, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                file.id,
                file.name,
                file.file_type,
                file.size as i64,
                file.location,
                file.owner_id,
                file.run_id,
                file.saved,
                file.parent_id,
                serde_json::to_string(&file.tags).unwrap(),
                file.created_at.to_rfc3339(),
            ],
        )
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn file_row(db: &Db, id: &str, owner: &str, run_id: Option<&str>, saved: bool, size: i64) {
        insert_owned_file(
            db,
            &File {
                id: id.to_string(),
                name: format!("{id}.txt"),
                file_type: "text".into(),
                size: size as u64,
                location: format!("/tmp/{id}"),
                owner_id: owner.to_string(),
                run_id: run_id.map(|s| s.to_string()),
                saved,
                parent_id: None,
                tags: vec![],
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
    }

    async fn insert_run(db: &Db, id: &str, owner: &str) {
        db.with_conn({
            let id = id.to_string();
            let owner = owner.to_string();
            move |conn| {
                conn.execute(
                    "INSERT INTO tool (id, name, name_lower, command_template, status, created_at)
                     VALUES ('tool-1', 'noop', 'noop', 'true', 'INSTALLED', '2026-01-01T00:00:00Z')
                     ON CONFLICT(id) DO NOTHING",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO run (id, tool_id, owner_id, tags, params, input_file_ids, command, status, stdout, created_at)
                     VALUES (?1, 'tool-1', ?2, '[]', '{}', '[]', 'true', 'COMPLETED', '', '2026-01-01T00:00:00Z')",
                    params![id, owner],
                )
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn deleting_a_run_removes_only_unsaved_files() {
        let db = Db::open_in_memory().unwrap();
        insert_run(&db, "run-1", "user-1").await;
        file_row(&db, "f-unsaved", "user-1", Some("run-1"), false, 10).await;
        file_row(&db, "f-saved", "user-1", Some("run-1"), true, 20).await;

        let principal = Principal { id: "user-1", is_admin: false };
        delete_run(&db, "run-1", principal).await.unwrap();

        let remaining: Vec<(String, Option<String>)> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT id, run_id FROM file ORDER BY id")?;
                let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
                rows.collect()
            })
            .await
            .unwrap();
        assert_eq!(remaining, vec![("f-saved".to_string(), None)]);
    }

    #[tokio::test]
    async fn delete_run_rejected_for_non_owner() {
        let db = Db::open_in_memory().unwrap();
        insert_run(&db, "run-1", "owner").await;
        let stranger = Principal { id: "stranger", is_admin: false };
        let err = delete_run(&db, "run-1", stranger).await.unwrap_err();
        assert!(err.to_string().contains("does not own"));
    }

    #[tokio::test]
    async fn quota_blocks_over_budget_storage() {
        let db = Db::open_in_memory().unwrap();
        file_row(&db, "f1", "user-1", None, true, 900).await;
        let quota = Quota { max_storage_bytes: 1000, max_files: 10 };
        let result = check_quota(&db, "user-1", quota, 200).await.unwrap();
        assert!(matches!(result, Err(QuotaError::StorageExceeded { .. })));
    }

    #[tokio::test]
    async fn quota_blocks_over_budget_file_count() {
        let db = Db::open_in_memory().unwrap();
        for i in 0..3 {
            file_row(&db, &format!("f{i}"), "user-1", None, true, 1).await;
        }
        let quota = Quota { max_storage_bytes: 1_000_000, max_files: 3 };
        let result = check_quota(&db, "user-1", quota, 1).await.unwrap();
        assert!(matches!(result, Err(QuotaError::FileCountExceeded { .. })));
    }

    #[tokio::test]
    async fn quota_admits_within_budget() {
        let db = Db::open_in_memory().unwrap();
        let quota = Quota { max_storage_bytes: 1000, max_files: 10 };
        let result = check_quota(&db, "user-1", quota, 200).await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn set_saved_detaches_future_cascade() {
        let db = Db::open_in_memory().unwrap();
        insert_run(&db, "run-1", "user-1").await;
        file_row(&db, "f-1", "user-1", Some("run-1"), false, 10).await;
        let principal = Principal { id: "user-1", is_admin: false };
        set_saved(&db, "f-1", true, principal).await.unwrap();
        delete_run(&db, "run-1", principal).await.unwrap();

        let remaining: i64 = db
            .with_conn(|conn| conn.query_row("SELECT count(*) FROM file WHERE id = 'f-1'", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
