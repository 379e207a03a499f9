//! Run Planner: validates a parameter bundle against a
//! tool's declared schema, resolves and authorises file references, renders
//! the final command, and persists a `PENDING` `Run` with its `RUN` job
//! already enqueued.

use crate::catalog::Catalog;
use crate::db::Db;
use crate::errors::PlanError;
use crate::queue::{JobKind, JobQueue};
use crate::template::{RenderContext, RenderValue, render};
use crate::types::{ParamKind, ParamSpec, Principal, Run, RunStatus, SandboxStatus};
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

/// Validates and dispatches runs.
#[derive(Clone)]
pub struct Planner {
    db: Db,
    catalog: Catalog,
    queue: JobQueue,
}

impl Planner {
    pub fn new(db: Db, catalog: Catalog, queue: JobQueue) -> Self {
        Self { db, catalog, queue }
    }

    /// Plan and dispatch one run: validate parameters, resolve file
    /// references, render the command, persist a `PENDING` Run, enqueue its
    /// job.
    pub async fn plan_run(
        &self,
        tool_id: &str,
        params_dict: &Value,
        tags: Vec<String>,
        principal: Principal<'_>,
    ) -> Result<Run, PlanError> {
        let tool = self
            .catalog
            .get_tool(tool_id)
            .await
            .map_err(|_| PlanError::ToolNotFound(tool_id.to_string()))?;

        // Step 1: eligibility.
        if !tool.enabled && !principal.is_admin {
            return Err(PlanError::ToolDisabled(tool.name.clone()));
        }
        if tool.status != SandboxStatus::Installed {
            return Err(PlanError::ToolNotReady(tool.name.clone()));
        }

        // Steps 2-3: validate/coerce each declared param, building the
        // resolved bundle and the render context in lockstep.
        let mut resolved = serde_json::Map::new();
        let mut input_file_ids = Vec::new();
        let mut ctx = RenderContext::new();

        for spec in &tool.params {
            let raw = params_dict.get(&spec.name).filter(|v| !v.is_null());
            let raw = match raw {
                Some(v) => v.clone(),
                None => {
                    if spec.required {
                        return Err(PlanError::MissingRequired(spec.name.clone()));
                    }
                    spec.default.clone().unwrap_or(Value::Null)
                }
            };

            let (resolved_value, render_value) = coerce_and_render(
                &self.db,
                spec,
                raw,
                &mut input_file_ids,
                principal,
            )
            .await?;

            resolved.insert(spec.name.clone(), resolved_value);
            ctx.insert(spec.name.clone(), render_value);
        }

        // Step 4: render the command.
        let command = render(&tool.command_template, &ctx)
            .map_err(|e| PlanError::InvalidParam {
                name: e.to_string(),
                kind: "template",
                value: tool.command_template.clone(),
            })?;

        // Step 5: persist the Run.
        let run_id = Run::new_id();
        let now = Utc::now();
        let run = Run {
            id: run_id.clone(),
            tool_id: tool.id.clone(),
            owner_id: principal.id.to_string(),
            tags,
            params: Value::Object(resolved),
            input_file_ids,
            command: command.clone(),
            pinned_manifest: tool.pinned_manifest.clone(),
            status: RunStatus::Pending,
            stdout: String::new(),
            job_handle: None,
            email_on_completion: false,
            shared: false,
            created_at: now,
            started_at: None,
            finished_at: None,
        };

        insert_run(&self.db, &run).await.map_err(PlanError::Storage)?;

        // Step 6: enqueue, then store the job handle.
        let job_id = self
            .queue
            .enqueue(JobKind::Run, run_id.clone(), Some(command))
            .await
            .map_err(|_| PlanError::ToolNotReady(tool.name.clone()))?;
        set_job_handle(&self.db, &run_id, &job_id)
            .await
            .map_err(PlanError::Storage)?;

        // Step 7: bump run_count.
        let _ = self.catalog.increment_run_count(&tool.id).await;

        Ok(Run {
            job_handle: Some(job_id),
            ..run
        })
    }
}

/// Validate+coerce one parameter value, returning both the JSON-resolved
/// value stored on the Run and the [`RenderValue`] fed to the template
/// renderer.
async fn coerce_and_render(
    db: &Db,
    spec: &ParamSpec,
    raw: Value,
    input_file_ids: &mut Vec<String>,
    principal: Principal<'_>,
) -> Result<(Value, RenderValue), PlanError> {
    match spec.kind {
        ParamKind::Str => {
            let s = raw
                .as_str()
                .ok_or_else(|| invalid(spec, "STR", &raw))?
                .to_string();
            Ok((Value::String(s.clone()), RenderValue::Quoted(s)))
        }
        ParamKind::Int => {
            let n = raw.as_i64().ok_or_else(|| invalid(spec, "INT", &raw))?;
            Ok((Value::from(n), RenderValue::Raw(n.to_string())))
        }
        ParamKind::Float => {
            let n = raw.as_f64().ok_or_else(|| invalid(spec, "FLOAT", &raw))?;
            Ok((Value::from(n), RenderValue::Raw(n.to_string())))
        }
        ParamKind::Bool => {
            let b = raw.as_bool().ok_or_else(|| invalid(spec, "BOOL", &raw))?;
            Ok((Value::Bool(b), RenderValue::Raw(b.to_string())))
        }
        ParamKind::Enum => {
            let s = raw
                .as_str()
                .ok_or_else(|| invalid(spec, "ENUM", &raw))?
                .to_string();
            if !spec.options.iter().any(|o| o == &s) {
                return Err(PlanError::InvalidEnum {
                    name: spec.name.clone(),
                    value: s,
                });
            }
            Ok((Value::String(s.clone()), RenderValue::Quoted(s)))
        }
        ParamKind::File => {
            let ids: Vec<String> = match &raw {
                Value::Array(items) => items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect(),
                Value::String(s) => vec![s.clone()],
                _ => return Err(invalid(spec, "FILE", &raw)),
            };

            if !spec.multiple && ids.len() != 1 {
                return Err(PlanError::FileArityMismatch(spec.name.clone()));
            }

            let mut basenames = Vec::with_capacity(ids.len());
            for file_id in &ids {
                let basename = resolve_owned_file(db, file_id, principal).await?;
                input_file_ids.push(file_id.clone());
                basenames.push(basename);
            }

            if spec.multiple {
                Ok((
                    Value::Array(ids.into_iter().map(Value::String).collect()),
                    RenderValue::QuotedList(basenames),
                ))
            } else {
                Ok((
                    Value::String(ids[0].clone()),
                    RenderValue::Quoted(basenames.into_iter().next().unwrap()),
                ))
            }
        }
    }
}

fn invalid(spec: &ParamSpec, kind: &'static str, value: &Value) -> PlanError {
    PlanError::InvalidParam {
        name: spec.name.clone(),
        kind,
        value: value.to_string(),
    }
}

/// Look up a file by id, verify the requesting principal may use it (owner
/// or admin), and return its stored basename.
async fn resolve_owned_file(
    db: &Db,
    file_id: &str,
    principal: Principal<'_>,
) -> Result<String, PlanError> {
    let file_id_owned = file_id.to_string();
    let row: Option<(String, String)> = db
        .with_conn(move |conn| {
            conn.query_row(
                "SELECT name, owner_id FROM file WHERE id = ?1",
                params![file_id_owned],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
        .await
        .map_err(|_| PlanError::FileNotFound(file_id.to_string()))?;

    let (name, owner_id) = row.ok_or_else(|| PlanError::FileNotFound(file_id.to_string()))?;
    if owner_id != principal.id && !principal.is_admin {
        return Err(PlanError::Forbidden {
            file: file_id.to_string(),
        });
    }
    Ok(name)
}

async fn insert_run(db: &Db, run: &Run) -> Result<(), rusqlite::Error> {
    let run = run.clone();
    db.with_conn(move |conn| {
        conn.execute(
            "INSERT INTO run (
                id, tool_id, owner_id, tags, params, input_file_ids, command,
                pinned_manifest, status, stdout, job_handle, email_on_completion,
                shared, created_at, started_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                run.id,
                run.tool_id,
                run.owner_id,
                serde_json::to_string(&run.tags).unwrap(),
                run.params.to_string(),
                serde_json::to_string(&run.input_file_ids).unwrap(),
                run.command,
                run.pinned_manifest,
                run.status.as_str(),
                run.stdout,
                run.job_handle,
                run.email_on_completion,
                run.shared,
                run.created_at.to_rfc3339(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.finished_at.map(|t| t.to_rfc3339()),
            ],
        )
    })
    .await
    .map_err(|e| e.downcast::<rusqlite::Error>().unwrap_or_else(|e| {
        rusqlite::Error::InvalidParameterName(e.to_string())
    }))?;
    Ok(())
}

async fn set_job_handle(db: &Db, run_id: &str, job_id: &str) -> Result<(), rusqlite::Error> {
    let run_id = run_id.to_string();
    let job_id = job_id.to_string();
    db.with_conn(move |conn| {
        conn.execute(
            "UPDATE run SET job_handle = ?1 WHERE id = ?2",
            params![job_id, run_id],
        )
    })
    .await
    .map_err(|e| {
        e.downcast::<rusqlite::Error>()
            .unwrap_or_else(|e| rusqlite::Error::InvalidParameterName(e.to_string()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SetupFile, TargetSpec};
    use serde_json::json;

    async fn setup() -> (Planner, Catalog, Db) {
        let db = Db::open_in_memory().unwrap();
        let catalog = Catalog::new(db.clone());
        let queue = JobQueue::new(db.clone());
        (Planner::new(db.clone(), catalog.clone(), queue), catalog, db)
    }

    #[tokio::test]
    async fn happy_path_renders_and_dispatches() {
        let (planner, catalog, _db) = setup().await;
        let tool = catalog
            .create_tool(
                "echo".into(),
                None,
                "echo {{msg}} > out.txt".into(),
                vec![ParamSpec {
                    name: "msg".into(),
                    kind: ParamKind::Str,
                    required: true,
                    default: None,
                    options: vec![],
                    multiple: false,
                }],
                vec![TargetSpec {
                    path_template: "out.txt".into(),
                    kind: "text".into(),
                    required: true,
                }],
                vec![],
                None,
                None,
                true,
            )
            .await
            .unwrap();

        let principal = Principal {
            id: "user-1",
            is_admin: false,
        };
        let run = planner
            .plan_run(
                &tool.id,
                &json!({ "msg": "hello world" }),
                vec![],
                principal,
            )
            .await
            .unwrap();

        assert_eq!(run.command, "echo 'hello_world' > out.txt");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.job_handle.is_some());
    }

    #[tokio::test]
    async fn missing_required_param_is_rejected() {
        let (planner, catalog, _db) = setup().await;
        let tool = catalog
            .create_tool(
                "echo".into(),
                None,
                "echo {{msg}}".into(),
                vec![ParamSpec {
                    name: "msg".into(),
                    kind: ParamKind::Str,
                    required: true,
                    default: None,
                    options: vec![],
                    multiple: false,
                }],
                vec![],
                vec![],
                None,
                None,
                true,
            )
            .await
            .unwrap();
        let principal = Principal {
            id: "user-1",
            is_admin: false,
        };
        let err = planner
            .plan_run(&tool.id, &json!({}), vec![], principal)
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::MissingRequired(name) if name == "msg"));
    }

    #[tokio::test]
    async fn disabled_tool_is_rejected_for_non_admin() {
        let (planner, catalog, _db) = setup().await;
        let tool = catalog
            .create_tool(
                "disabled_tool".into(),
                None,
                "true".into(),
                vec![],
                vec![],
                vec![],
                None,
                None,
                false,
            )
            .await
            .unwrap();
        let principal = Principal {
            id: "user-1",
            is_admin: false,
        };
        let err = planner
            .plan_run(&tool.id, &json!({}), vec![], principal)
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::ToolDisabled(_)));
    }

    #[tokio::test]
    async fn tool_with_sandbox_not_installed_is_not_ready() {
        let (planner, catalog, _db) = setup().await;
        let tool = catalog
            .create_tool(
                "sandboxed".into(),
                None,
                "true".into(),
                vec![],
                vec![],
                vec![],
                Some("channels: []".into()),
                None,
                true,
            )
            .await
            .unwrap();
        let principal = Principal {
            id: "user-1",
            is_admin: false,
        };
        let err = planner
            .plan_run(&tool.id, &json!({}), vec![], principal)
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::ToolNotReady(_)));
    }

    #[tokio::test]
    async fn file_param_resolves_owned_files_to_basenames() {
        let (planner, catalog, db) = setup().await;
        let tool = catalog
            .create_tool(
                "aligner".into(),
                None,
                "align --in {{reads}}".into(),
                vec![ParamSpec {
                    name: "reads".into(),
                    kind: ParamKind::File,
                    required: true,
                    default: None,
                    options: vec![],
                    multiple: true,
                }],
                vec![],
                vec![],
                None,
                None,
                true,
            )
            .await
            .unwrap();

        for (id, name) in [("file-a", "a.fastq"), ("file-b", "b.fastq")] {
            db.with_conn({
                let id = id.to_string();
                let name = name.to_string();
                move |conn| {
                    conn.execute(
                        "INSERT INTO file (id, name, file_type, size, location, owner_id, saved, tags, created_at)
                         VALUES (?1, ?2, 'text', 10, '/blobs/x', 'user-1', 0, '[]', '2026-01-01T00:00:00Z')",
                        params![id, name],
                    )
                }
            })
            .await
            .unwrap();
        }

        let principal = Principal {
            id: "user-1",
            is_admin: false,
        };
        let run = planner
            .plan_run(
                &tool.id,
                &json!({ "reads": ["file-a", "file-b"] }),
                vec![],
                principal,
            )
            .await
            .unwrap();

        assert_eq!(run.command, "align --in 'a.fastq' 'b.fastq'");
        assert_eq!(run.input_file_ids, vec!["file-a", "file-b"]);
    }

    #[tokio::test]
    async fn file_owned_by_someone_else_is_forbidden() {
        let (planner, catalog, db) = setup().await;
        let tool = catalog
            .create_tool(
                "aligner".into(),
                None,
                "align --in {{reads}}".into(),
                vec![ParamSpec {
                    name: "reads".into(),
                    kind: ParamKind::File,
                    required: true,
                    default: None,
                    options: vec![],
                    multiple: false,
                }],
                vec![],
                vec![],
                None,
                None,
                true,
            )
            .await
            .unwrap();

        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO file (id, name, file_type, size, location, owner_id, saved, tags, created_at)
                 VALUES ('file-x', 'x.fastq', 'text', 10, '/blobs/x', 'someone-else', 0, '[]', '2026-01-01T00:00:00Z')",
                [],
            )
        })
        .await
        .unwrap();

        let principal = Principal {
            id: "user-1",
            is_admin: false,
        };
        let err = planner
            .plan_run(&tool.id, &json!({ "reads": "file-x" }), vec![], principal)
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::Forbidden { .. }));
    }
}
