//! Persistent store of tool definitions.
//!
//! Pure CRUD over `Tool`/`ParamSpec`/`TargetSpec`/`SetupFile`, enforcing the
//! write-time invariants: names are case-insensitively unique, `ENUM`
//! params declare at least one option, `FILE` params default to required.
//! Sandbox status is never set here — only the Sandbox Manager and
//! Supervisor write it. Validate-then-store, backed by `rusqlite` rows
//! rather than files on disk, since sandbox status must survive a restart.

use crate::db::Db;
use crate::errors::CatalogError;
use crate::types::{ParamKind, ParamSpec, SandboxStatus, SetupFile, TargetSpec, Tool};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

/// Handle onto the tool catalog.
#[derive(Clone)]
pub struct Catalog {
    db: Db,
}

impl Catalog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a new tool definition. `id`, `status`, `pinned_manifest`,
    /// `installation_log`, `run_count`, `favourited_count` and `created_at`
    /// are assigned here; callers supply everything else.
    pub async fn create_tool(
        &self,
        name: String,
        version: Option<String>,
        command_template: String,
        mut params_spec: Vec<ParamSpec>,
        targets: Vec<TargetSpec>,
        setup_files: Vec<SetupFile>,
        sandbox_spec: Option<String>,
        post_install_command: Option<String>,
        enabled: bool,
    ) -> Result<Tool, CatalogError> {
        validate_param_specs(&mut params_spec)?;

        // A tool with no dependency sandbox has nothing to install; it is
        // ready to run immediately. Only tools that declare a sandbox start
        // life UNINSTALLED and wait on the Sandbox Manager.
        let initial_status = if sandbox_spec.is_none() {
            SandboxStatus::Installed
        } else {
            SandboxStatus::Uninstalled
        };

        let tool = Tool {
            id: Tool::new_id(),
            name,
            version,
            command_template,
            params: params_spec,
            targets,
            setup_files,
            sandbox_spec,
            post_install_command,
            status: initial_status,
            pinned_manifest: None,
            installation_log: None,
            enabled,
            run_count: 0,
            favourited_count: 0,
            created_at: Utc::now(),
        };

        self.db
            .with_conn({
                let tool = tool.clone();
                move |conn| insert_tool(conn, &tool)
            })
            .await
            .map_err(map_storage_err)?;

        Ok(tool)
    }

    pub async fn get_tool(&self, tool_id: &str) -> Result<Tool, CatalogError> {
        let tool_id = tool_id.to_string();
        self.db
            .with_conn(move |conn| load_tool(conn, &tool_id))
            .await
            .map_err(map_storage_err)?
            .ok_or_else(|| CatalogError::NotFound(String::new()))
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, CatalogError> {
        self.db
            .with_conn(list_all_tools)
            .await
            .map_err(map_storage_err)
    }

    /// Delete a tool. Rejected while a sandbox install/uninstall is in flight.
    pub async fn delete_tool(&self, tool_id: &str) -> Result<(), CatalogError> {
        let tool = self.get_tool(tool_id).await?;
        if matches!(
            tool.status,
            SandboxStatus::Installing | SandboxStatus::Uninstalling
        ) {
            return Err(CatalogError::SandboxBusy(tool.name));
        }
        let tool_id = tool_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute("DELETE FROM tool WHERE id = ?1", params![tool_id])
            })
            .await
            .map_err(map_storage_err)?;
        Ok(())
    }

    /// Set `enabled`. Only the Catalog's own writers may touch this column;
    /// Sandbox Manager / Supervisor never do.
    pub async fn set_enabled(&self, tool_id: &str, enabled: bool) -> Result<(), CatalogError> {
        let tool_id = tool_id.to_string();
        let changed = self
            .db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE tool SET enabled = ?1 WHERE id = ?2",
                    params![enabled, tool_id],
                )
            })
            .await
            .map_err(map_storage_err)?;
        if changed == 0 {
            return Err(CatalogError::NotFound(String::new()));
        }
        Ok(())
    }

    /// Atomically bump `run_count` by one (Planner step 7).
    pub(crate) async fn increment_run_count(&self, tool_id: &str) -> Result<(), CatalogError> {
        let tool_id = tool_id.to_string();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE tool SET run_count = run_count + 1 WHERE id = ?1",
                    params![tool_id],
                )
            })
            .await
            .map_err(map_storage_err)?;
        Ok(())
    }

    /// Favourite or unfavourite a tool on behalf of a user. The core keeps
    /// only the aggregate count (`spec.md` §3: `favourited_count`); per-user
    /// favourite membership is an external API-facade concern.
    pub async fn set_favourited(&self, tool_id: &str, favourited: bool) -> Result<(), CatalogError> {
        let tool_id = tool_id.to_string();
        let delta = if favourited { 1 } else { -1 };
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE tool SET favourited_count = MAX(favourited_count + ?1, 0) WHERE id = ?2",
                    params![delta, tool_id],
                )
            })
            .await
            .map_err(map_storage_err)?;
        Ok(())
    }

    /// Write a new sandbox status, optionally along with `pinned_manifest`
    /// and `installation_log`. Exclusively used by the Sandbox Manager.
    pub(crate) async fn set_sandbox_status(
        &self,
        tool_id: &str,
        status: SandboxStatus,
        pinned_manifest: Option<String>,
        installation_log: Option<String>,
    ) -> Result<(), CatalogError> {
        let tool_id = tool_id.to_string();
        let status_str = status.as_str();
        self.db
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE tool SET status = ?1,
                        pinned_manifest = COALESCE(?2, pinned_manifest),
                        installation_log = COALESCE(?3, installation_log)
                     WHERE id = ?4",
                    params![status_str, pinned_manifest, installation_log, tool_id],
                )
            })
            .await
            .map_err(map_storage_err)?;
        Ok(())
    }
}

fn validate_param_specs(specs: &mut [ParamSpec]) -> Result<(), CatalogError> {
    for p in specs {
        if p.kind == ParamKind::Enum && p.options.is_empty() {
            return Err(CatalogError::EnumWithoutOptions(p.name.clone()));
        }
        // FILE params always reference a file the Planner must resolve before
        // a run can be composed; there is no sensible optional-FILE case, so
        // the Catalog normalizes `required` rather than trusting the caller.
        if p.kind == ParamKind::File {
            p.required = true;
        }
    }
    Ok(())
}

fn insert_tool(conn: &Connection, tool: &Tool) -> rusqlite::Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM tool WHERE name_lower = ?1",
            params![tool.name.to_lowercase()],
            |row| row.get(0),
        )
        .optional()?;
    if existing.is_some() {
        // Checked early for a clean error message; the UNIQUE index on
        // name_lower would also catch this, but with a less specific message.
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::ConstraintViolation,
                extended_code: 2067, // SQLITE_CONSTRAINT_UNIQUE
            },
            Some(format!("duplicate tool name '{}'", tool.name)),
        ));
    }

    conn.execute(
        "INSERT INTO tool (
            id, name, name_lower, version, command_template, sandbox_spec,
            post_install_command, status, pinned_manifest, installation_log,
            enabled, run_count, favourited_count, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            tool.id,
            tool.name,
            tool.name.to_lowercase(),
            tool.version,
            tool.command_template,
            tool.sandbox_spec,
            tool.post_install_command,
            tool.status.as_str(),
            tool.pinned_manifest,
            tool.installation_log,
            tool.enabled,
            tool.run_count,
            tool.favourited_count,
            tool.created_at.to_rfc3339(),
        ],
    )?;

    for (i, p) in tool.params.iter().enumerate() {
        conn.execute(
            "INSERT INTO param_spec (id, tool_id, position, name, kind, required, default_value, options, multiple)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                uuid::Uuid::new_v4().to_string(),
                tool.id,
                i as i64,
                p.name,
                p.kind.as_str(),
                p.required,
                p.default.as_ref().map(|v| v.to_string()),
                serde_json::to_string(&p.options).unwrap(),
                p.multiple,
            ],
        )?;
    }

    for (i, t) in tool.targets.iter().enumerate() {
        conn.execute(
            "INSERT INTO target_spec (id, tool_id, position, path_template, kind, required)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                uuid::Uuid::new_v4().to_string(),
                tool.id,
                i as i64,
                t.path_template,
                t.kind,
                t.required,
            ],
        )?;
    }

    for (i, s) in tool.setup_files.iter().enumerate() {
        conn.execute(
            "INSERT INTO setup_file (id, tool_id, position, name, content_template)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                tool.id,
                i as i64,
                s.name,
                s.content_template,
            ],
        )?;
    }

    Ok(())
}

fn load_tool(conn: &Connection, tool_id: &str) -> rusqlite::Result<Option<Tool>> {
    let row = conn
        .query_row(
            "SELECT id, name, version, command_template, sandbox_spec,
                    post_install_command, status, pinned_manifest, installation_log,
                    enabled, run_count, favourited_count, created_at
             FROM tool WHERE id = ?1",
            params![tool_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, bool>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, i64>(11)?,
                    row.get::<_, String>(12)?,
                ))
            },
        )
        .optional()?;

    let Some((
        id,
        name,
        version,
        command_template,
        sandbox_spec,
        post_install_command,
        status,
        pinned_manifest,
        installation_log,
        enabled,
        run_count,
        favourited_count,
        created_at,
    )) = row
    else {
        return Ok(None);
    };

    let params_spec = load_params(conn, &id)?;
    let targets = load_targets(conn, &id)?;
    let setup_files = load_setup_files(conn, &id)?;

    Ok(Some(Tool {
        id,
        name,
        version,
        command_template,
        params: params_spec,
        targets,
        setup_files,
        sandbox_spec,
        post_install_command,
        status: SandboxStatus::parse(&status),
        pinned_manifest,
        installation_log,
        enabled,
        run_count,
        favourited_count,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    }))
}

fn load_params(conn: &Connection, tool_id: &str) -> rusqlite::Result<Vec<ParamSpec>> {
    let mut stmt = conn.prepare(
        "SELECT name, kind, required, default_value, options, multiple
         FROM param_spec WHERE tool_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![tool_id], |row| {
        let kind_str: String = row.get(1)?;
        let options_str: String = row.get(4)?;
        let default_str: Option<String> = row.get(3)?;
        Ok(ParamSpec {
            name: row.get(0)?,
            kind: ParamKind::parse(&kind_str).unwrap_or(ParamKind::Str),
            required: row.get(2)?,
            default: default_str.and_then(|s| serde_json::from_str(&s).ok()),
            options: serde_json::from_str(&options_str).unwrap_or_default(),
            multiple: row.get(5)?,
        })
    })?;
    rows.collect()
}

fn load_targets(conn: &Connection, tool_id: &str) -> rusqlite::Result<Vec<TargetSpec>> {
    let mut stmt = conn.prepare(
        "SELECT path_template, kind, required FROM target_spec WHERE tool_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![tool_id], |row| {
        Ok(TargetSpec {
            path_template: row.get(0)?,
            kind: row.get(1)?,
            required: row.get(2)?,
        })
    })?;
    rows.collect()
}

fn load_setup_files(conn: &Connection, tool_id: &str) -> rusqlite::Result<Vec<SetupFile>> {
    let mut stmt = conn.prepare(
        "SELECT name, content_template FROM setup_file WHERE tool_id = ?1 ORDER BY position",
    )?;
    let rows = stmt.query_map(params![tool_id], |row| {
        Ok(SetupFile {
            name: row.get(0)?,
            content_template: row.get(1)?,
        })
    })?;
    rows.collect()
}

fn list_all_tools(conn: &Connection) -> rusqlite::Result<Vec<Tool>> {
    let mut stmt = conn.prepare("SELECT id FROM tool ORDER BY created_at DESC")?;
    let ids: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    ids.into_iter()
        .map(|id| load_tool(conn, &id).map(|t| t.expect("just listed")))
        .collect()
}

fn map_storage_err(e: anyhow::Error) -> CatalogError {
    match e.downcast::<rusqlite::Error>() {
        Ok(rusqlite::Error::SqliteFailure(err, Some(msg)))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            CatalogError::DuplicateName(
                msg.strip_prefix("duplicate tool name '")
                    .and_then(|s| s.strip_suffix('\''))
                    .unwrap_or(&msg)
                    .to_string(),
            )
        }
        Ok(e) => CatalogError::Storage(e),
        Err(e) => CatalogError::Storage(rusqlite::Error::InvalidParameterName(e.to_string())),
    }
}
