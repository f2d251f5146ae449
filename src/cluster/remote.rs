//! HTTP-backed collaborator clients
//!
//! Thin JSON-over-HTTP bindings for deployments where the scheduler and
//! directory sit behind their own HTTP bridges. Each call carries the
//! downstream bearer so the upstream authenticates the end-user, not the
//! gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::io::AsyncRead;
use tracing::debug;

use super::{
    ActionTotals, DirectoryClient, JobAction, JobId, SchedulerClient, SecurityContext,
};
use crate::{Error, Result};

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .tcp_nodelay(true)
        .build()
        .map_err(|e| Error::Config(format!("HTTP client: {e}")))
}

fn upstream_error(e: &reqwest::Error, what: &str) -> Error {
    if e.is_timeout() {
        Error::UpstreamTimeout(format!("{what}: {e}"))
    } else {
        Error::Upstream(format!("{what}: {e}"))
    }
}

/// Scheduler bridge speaking JSON over HTTP
pub struct RemoteScheduler {
    client: Client,
    addr: RwLock<Option<String>>,
}

impl RemoteScheduler {
    /// Create with an optional initial address; the directory reconciler
    /// fills it in later when unset
    pub fn new(addr: Option<String>, timeout: Duration) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            client: build_client(timeout)?,
            addr: RwLock::new(addr),
        }))
    }

    /// Replace the cached scheduler address
    pub fn set_addr(&self, addr: String) {
        let mut current = self.addr.write();
        if current.as_deref() != Some(addr.as_str()) {
            debug!(addr = %addr, "Scheduler address updated");
            *current = Some(addr);
        }
    }

    /// Current address, if resolved
    #[must_use]
    pub fn addr(&self) -> Option<String> {
        self.addr.read().clone()
    }

    fn require_addr(&self) -> Result<String> {
        self.addr
            .read()
            .clone()
            .ok_or_else(|| Error::Upstream("scheduler address not yet resolved".to_string()))
    }

    async fn call(&self, ctx: &SecurityContext, op: &str, params: Value) -> Result<Value> {
        let addr = self.require_addr()?;
        let mut request = self
            .client
            .post(format!("{addr}/{op}"))
            .json(&params);
        if let Some(token) = &ctx.downstream_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| upstream_error(&e, "scheduler"))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| upstream_error(&e, "scheduler response"))?;
        if !status.is_success() {
            // Scheduler-reported failures carry classic error strings that
            // the REST dispatcher classifies
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("scheduler error")
                .to_string();
            return Err(Error::Internal(message));
        }
        Ok(body)
    }
}

#[async_trait]
impl SchedulerClient for RemoteScheduler {
    async fn query_jobs(
        &self,
        ctx: &SecurityContext,
        constraint: &str,
        projection: &[String],
    ) -> Result<Vec<Value>> {
        let body = self
            .call(
                ctx,
                "query",
                json!({"constraint": constraint, "projection": projection}),
            )
            .await?;
        Ok(body
            .get("jobs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_job(&self, ctx: &SecurityContext, id: JobId) -> Result<Value> {
        let jobs = self
            .query_jobs(
                ctx,
                &format!("ClusterId == {} && ProcId == {}", id.cluster, id.proc),
                &[],
            )
            .await?;
        jobs.into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    async fn submit_job(&self, ctx: &SecurityContext, description: Value) -> Result<JobId> {
        let body = self.call(ctx, "submit", description).await?;
        let id = body
            .get("job_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Upstream("submit response missing job_id".to_string()))?;
        id.parse()
    }

    async fn act_on_job(
        &self,
        ctx: &SecurityContext,
        id: JobId,
        action: JobAction,
        reason: Option<&str>,
    ) -> Result<()> {
        self.call(
            ctx,
            action.as_str(),
            json!({"job_id": id.to_string(), "reason": reason}),
        )
        .await
        .map(|_| ())
    }

    async fn act_on_constraint(
        &self,
        ctx: &SecurityContext,
        constraint: &str,
        action: JobAction,
        reason: Option<&str>,
    ) -> Result<ActionTotals> {
        let body = self
            .call(
                ctx,
                action.as_str(),
                json!({"constraint": constraint, "reason": reason}),
            )
            .await?;
        serde_json::from_value(body.get("results").cloned().unwrap_or_default())
            .map_err(|e| Error::Upstream(format!("malformed action totals: {e}")))
    }

    async fn edit_job(
        &self,
        ctx: &SecurityContext,
        id: JobId,
        attributes: &[(String, String)],
    ) -> Result<()> {
        self.call(
            ctx,
            "edit",
            json!({"job_id": id.to_string(), "attributes": attributes}),
        )
        .await
        .map(|_| ())
    }

    async fn edit_constraint(
        &self,
        ctx: &SecurityContext,
        constraint: &str,
        attributes: &[(String, String)],
    ) -> Result<ActionTotals> {
        let body = self
            .call(
                ctx,
                "edit",
                json!({"constraint": constraint, "attributes": attributes}),
            )
            .await?;
        serde_json::from_value(body.get("results").cloned().unwrap_or_default())
            .map_err(|e| Error::Upstream(format!("malformed action totals: {e}")))
    }

    async fn upload_sandbox(&self, ctx: &SecurityContext, id: JobId, tar: Bytes) -> Result<()> {
        let addr = self.require_addr()?;
        let mut request = self
            .client
            .put(format!("{addr}/sandbox/{id}"))
            .header("content-type", "application/x-tar")
            .body(tar);
        if let Some(token) = &ctx.downstream_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| upstream_error(&e, "sandbox upload"))?;
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "sandbox upload failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn download_sandbox(
        &self,
        ctx: &SecurityContext,
        id: JobId,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let addr = self.require_addr()?;
        let mut request = self.client.get(format!("{addr}/sandbox/{id}"));
        if let Some(token) = &ctx.downstream_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| upstream_error(&e, "sandbox download"))?;
        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "sandbox download failed: HTTP {}",
                response.status()
            )));
        }
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(Box::new(tokio_util::io::StreamReader::new(stream)))
    }
}

/// Directory bridge speaking JSON over HTTP
pub struct RemoteDirectory {
    client: Client,
    addr: String,
}

impl RemoteDirectory {
    /// Create against the configured directory address
    pub fn new(addr: String, timeout: Duration) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            client: build_client(timeout)?,
            addr,
        }))
    }
}

#[async_trait]
impl DirectoryClient for RemoteDirectory {
    async fn query_ads(&self, ad_type: Option<&str>, name: Option<&str>) -> Result<Vec<Value>> {
        let mut url = format!("{}/ads", self.addr);
        if let Some(t) = ad_type {
            url.push('/');
            url.push_str(t);
            if let Some(n) = name {
                url.push('/');
                url.push_str(n);
            }
        }
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| upstream_error(&e, "directory"))?;
        if !response.status().is_success() {
            return Err(Error::Upstream(format!(
                "directory query failed: HTTP {}",
                response.status()
            )));
        }
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| upstream_error(&e, "directory response"))
    }

    async fn locate_scheduler(&self, name: Option<&str>) -> Result<Option<String>> {
        let ads = self.query_ads(Some("scheduler"), name).await?;
        Ok(ads
            .first()
            .and_then(|ad| ad.get("address"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_address_updates_once_resolved() {
        let scheduler =
            RemoteScheduler::new(None, Duration::from_secs(5)).unwrap();
        assert!(scheduler.addr().is_none());
        assert!(scheduler.require_addr().is_err());

        scheduler.set_addr("http://sched.cluster:9618".to_string());
        assert_eq!(
            scheduler.addr().as_deref(),
            Some("http://sched.cluster:9618")
        );

        // Idempotent update
        scheduler.set_addr("http://sched.cluster:9618".to_string());
        assert_eq!(
            scheduler.addr().as_deref(),
            Some("http://sched.cluster:9618")
        );
    }
}
