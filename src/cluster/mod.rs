//! Collaborator interfaces for the scheduler and directory
//!
//! The gateway depends only on these seams; the client libraries that
//! speak the cluster wire protocol implement them. Trait objects are
//! injected at construction, never reached through ambient state.

pub mod attributes;
pub mod remote;
pub mod tools;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncRead;

use crate::token::SessionHandle;
use crate::{Error, Result};

/// A job identifier in `<cluster>.<proc>` form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    /// Cluster number
    pub cluster: u64,
    /// Process number within the cluster
    pub proc: u64,
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cluster, self.proc)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (cluster, proc) = s
            .split_once('.')
            .ok_or_else(|| Error::Protocol(format!("invalid job id: {s}")))?;
        Ok(Self {
            cluster: cluster
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid job id: {s}")))?,
            proc: proc
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid job id: {s}")))?,
        })
    }
}

/// Outcome totals of a bulk job operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTotals {
    /// Jobs matched by the constraint
    pub total: u64,
    /// Jobs the action succeeded on
    pub success: u64,
    /// Jobs that vanished mid-operation
    pub not_found: u64,
    /// Jobs the caller may not act on
    pub permission_denied: u64,
    /// Jobs in a status the action does not apply to
    pub bad_status: u64,
    /// Jobs already in the target state
    pub already_done: u64,
    /// Jobs that failed for any other reason
    pub error: u64,
}

/// Actions a job or constraint can be subjected to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    /// Remove from the queue
    Remove,
    /// Put on hold
    Hold,
    /// Release from hold
    Release,
}

impl JobAction {
    /// Lower-case wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remove => "remove",
            Self::Hold => "hold",
            Self::Release => "release",
        }
    }
}

/// Request-scoped security context carried from the middleware into every
/// downstream call, so the scheduler authenticates the end-user.
#[derive(Debug, Clone)]
pub struct SecurityContext {
    /// Resolved end-user subject
    pub subject: String,
    /// Scopes granted to the presented access token
    pub granted_scopes: Vec<String>,
    /// Short-lived downstream bearer for the scheduler
    pub downstream_token: Option<String>,
    /// Cached cryptographic session container for this identity
    pub session_handle: Option<Arc<SessionHandle>>,
}

impl SecurityContext {
    /// Context with no downstream credential (directory-only requests)
    #[must_use]
    pub fn identity_only(subject: String, granted_scopes: Vec<String>) -> Self {
        Self {
            subject,
            granted_scopes,
            downstream_token: None,
            session_handle: None,
        }
    }
}

/// Scheduler client seam
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Query jobs matching `constraint`, optionally projecting attributes
    async fn query_jobs(
        &self,
        ctx: &SecurityContext,
        constraint: &str,
        projection: &[String],
    ) -> Result<Vec<Value>>;

    /// Fetch a single job ad
    async fn get_job(&self, ctx: &SecurityContext, id: JobId) -> Result<Value>;

    /// Submit a job, returning its id
    async fn submit_job(&self, ctx: &SecurityContext, description: Value) -> Result<JobId>;

    /// Apply an action to one job
    async fn act_on_job(
        &self,
        ctx: &SecurityContext,
        id: JobId,
        action: JobAction,
        reason: Option<&str>,
    ) -> Result<()>;

    /// Apply an action to every job matching `constraint`
    async fn act_on_constraint(
        &self,
        ctx: &SecurityContext,
        constraint: &str,
        action: JobAction,
        reason: Option<&str>,
    ) -> Result<ActionTotals>;

    /// Edit attributes on one job; values are rendered attribute expressions
    async fn edit_job(
        &self,
        ctx: &SecurityContext,
        id: JobId,
        attributes: &[(String, String)],
    ) -> Result<()>;

    /// Edit attributes on every job matching `constraint`
    async fn edit_constraint(
        &self,
        ctx: &SecurityContext,
        constraint: &str,
        attributes: &[(String, String)],
    ) -> Result<ActionTotals>;

    /// Upload a job input sandbox (tar bytes)
    async fn upload_sandbox(&self, ctx: &SecurityContext, id: JobId, tar: Bytes) -> Result<()>;

    /// Stream a job output sandbox (tar bytes)
    async fn download_sandbox(
        &self,
        ctx: &SecurityContext,
        id: JobId,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// Directory client seam
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Query daemon advertisements, optionally filtered by type and name
    async fn query_ads(
        &self,
        ad_type: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<Value>>;

    /// Resolve the scheduler address advertised under `name`
    async fn locate_scheduler(&self, name: Option<&str>) -> Result<Option<String>>;
}

/// Tool host seam for the JSON-RPC surface. Runs tool logic against the
/// scheduler using the security context stamped by the middleware.
#[async_trait]
pub trait ToolHost: Send + Sync {
    /// Handle `initialize`
    async fn initialize(&self, ctx: &SecurityContext) -> Result<Value>;
    /// Handle `tools/list`
    async fn list_tools(&self, ctx: &SecurityContext) -> Result<Value>;
    /// Handle `tools/call`
    async fn call_tool(
        &self,
        ctx: &SecurityContext,
        name: &str,
        arguments: Value,
    ) -> Result<Value>;
    /// Handle `resources/list`
    async fn list_resources(&self, ctx: &SecurityContext) -> Result<Value>;
    /// Handle `resources/read`
    async fn read_resource(&self, ctx: &SecurityContext, uri: &str) -> Result<Value>;
}

/// Translate a classic scheduler error string into the error taxonomy.
///
/// The scheduler client surfaces stringly-typed failures; single-job REST
/// operations map them onto HTTP statuses through this table.
#[must_use]
pub fn classify_scheduler_error(message: &str) -> Error {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("eacces") {
        Error::InsufficientScope(message.to_string())
    } else if lower.contains("immutable") || lower.contains("protected") {
        Error::InsufficientScope(message.to_string())
    } else if lower.contains("enoent") || lower.contains("nonexistent") || lower.contains("not found")
    {
        Error::NotFound(message.to_string())
    } else if lower.contains("authentication") || lower.contains("security") {
        Error::Authentication(message.to_string())
    } else {
        Error::Internal(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn job_id_parses_cluster_dot_proc() {
        let id: JobId = "123.4".parse().unwrap();
        assert_eq!(id, JobId { cluster: 123, proc: 4 });
        assert_eq!(id.to_string(), "123.4");
    }

    #[test]
    fn job_id_rejects_malformed_forms() {
        assert!("123".parse::<JobId>().is_err());
        assert!("a.b".parse::<JobId>().is_err());
        assert!("1.-2".parse::<JobId>().is_err());
        assert!("".parse::<JobId>().is_err());
        assert!("1.2.3".parse::<JobId>().is_err());
    }

    #[test]
    fn error_classification_table() {
        assert_eq!(
            classify_scheduler_error("Permission denied (EACCES)").status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            classify_scheduler_error("job is protected and immutable").status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            classify_scheduler_error("ENOENT: no such cluster").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            classify_scheduler_error("job 3.0 nonexistent").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            classify_scheduler_error("SECURITY session expired").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            classify_scheduler_error("shadow exception").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn totals_serialize_with_all_fields() {
        let totals = ActionTotals {
            total: 3,
            success: 3,
            ..Default::default()
        };
        let v = serde_json::to_value(totals).unwrap();
        assert_eq!(v["total"], 3);
        assert_eq!(v["success"], 3);
        assert_eq!(v["already_done"], 0);
        assert_eq!(v["permission_denied"], 0);
    }
}
