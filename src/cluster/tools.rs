//! Scheduler-backed tool host
//!
//! The default tool host: runs the standard job tools directly against the
//! scheduler client, using the security context stamped by the middleware.
//! Read tools are `query_*`/`get_*`; everything else mutates the queue.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::attributes::render_attributes;
use super::{JobAction, JobId, SchedulerClient, SecurityContext, ToolHost};
use crate::error::rpc_codes;
use crate::{Error, Result};

/// Tool descriptors advertised by `tools/list`
const TOOLS: &[(&str, &str)] = &[
    ("query_jobs", "Query jobs matching a constraint expression"),
    ("get_job", "Fetch a single job ad by <cluster>.<proc> id"),
    ("submit_job", "Submit a job description to the scheduler"),
    ("remove_job", "Remove a job from the queue"),
    ("hold_job", "Put a job on hold"),
    ("release_job", "Release a held job"),
    ("edit_job", "Edit attributes on a job"),
];

/// Tool host that executes against the scheduler client
pub struct SchedulerToolHost {
    scheduler: Arc<dyn SchedulerClient>,
}

impl SchedulerToolHost {
    /// Wrap a scheduler client
    #[must_use]
    pub fn new(scheduler: Arc<dyn SchedulerClient>) -> Self {
        Self { scheduler }
    }
}

fn arg_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::json_rpc(rpc_codes::INVALID_PARAMS, format!("{key} is required")))
}

fn arg_job_id(arguments: &Value) -> Result<JobId> {
    JobId::from_str(arg_str(arguments, "job_id")?)
        .map_err(|e| Error::json_rpc(rpc_codes::INVALID_PARAMS, e.to_string()))
}

fn reason_of(arguments: &Value) -> Option<String> {
    arguments
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl ToolHost for SchedulerToolHost {
    async fn initialize(&self, _ctx: &SecurityContext) -> Result<Value> {
        Ok(json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {"tools": {}, "resources": {}},
        }))
    }

    async fn list_tools(&self, _ctx: &SecurityContext) -> Result<Value> {
        let tools: Vec<Value> = TOOLS
            .iter()
            .map(|(name, description)| json!({"name": name, "description": description}))
            .collect();
        Ok(json!({"tools": tools}))
    }

    async fn call_tool(
        &self,
        ctx: &SecurityContext,
        name: &str,
        arguments: Value,
    ) -> Result<Value> {
        match name {
            "query_jobs" => {
                let constraint = arguments
                    .get("constraint")
                    .and_then(Value::as_str)
                    .unwrap_or("true");
                let projection: Vec<String> = arguments
                    .get("projection")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let jobs = self.scheduler.query_jobs(ctx, constraint, &projection).await?;
                let count = jobs.len();
                Ok(json!({
                    "content": jobs,
                    "metadata": {"count": count},
                }))
            }
            "get_job" => {
                let id = arg_job_id(&arguments)?;
                let ad = self.scheduler.get_job(ctx, id).await?;
                Ok(json!({"content": ad, "metadata": {"count": 1}}))
            }
            "submit_job" => {
                let description = arguments
                    .get("description")
                    .cloned()
                    .unwrap_or(arguments.clone());
                let id = self.scheduler.submit_job(ctx, description).await?;
                Ok(json!({"job_id": id.to_string()}))
            }
            "remove_job" | "hold_job" | "release_job" => {
                let action = match name {
                    "remove_job" => JobAction::Remove,
                    "hold_job" => JobAction::Hold,
                    _ => JobAction::Release,
                };
                let id = arg_job_id(&arguments)?;
                self.scheduler
                    .act_on_job(ctx, id, action, reason_of(&arguments).as_deref())
                    .await?;
                Ok(json!({"job_id": id.to_string(), "status": "ok"}))
            }
            "edit_job" => {
                let id = arg_job_id(&arguments)?;
                let attrs = arguments
                    .get("attributes")
                    .and_then(Value::as_object)
                    .ok_or_else(|| {
                        Error::json_rpc(rpc_codes::INVALID_PARAMS, "attributes is required")
                    })?;
                let rendered = render_attributes(attrs);
                self.scheduler.edit_job(ctx, id, &rendered).await?;
                Ok(json!({"job_id": id.to_string(), "status": "ok"}))
            }
            other => Err(Error::json_rpc(
                rpc_codes::METHOD_NOT_FOUND,
                format!("unknown tool {other}"),
            )),
        }
    }

    async fn list_resources(&self, _ctx: &SecurityContext) -> Result<Value> {
        Ok(json!({
            "resources": [
                {"uri": "jobs://queue", "name": "Job queue", "mimeType": "application/json"},
            ],
        }))
    }

    async fn read_resource(&self, ctx: &SecurityContext, uri: &str) -> Result<Value> {
        match uri {
            "jobs://queue" => {
                let jobs = self.scheduler.query_jobs(ctx, "true", &[]).await?;
                Ok(json!({
                    "contents": [{
                        "uri": uri,
                        "mimeType": "application/json",
                        "text": serde_json::to_string(&jobs)?,
                    }],
                }))
            }
            other => Err(Error::json_rpc(
                rpc_codes::INVALID_PARAMS,
                format!("unknown resource {other}"),
            )),
        }
    }
}
