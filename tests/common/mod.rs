//! Shared end-to-end test harness
//!
//! Boots the real router over an in-memory mock scheduler, a temp-file
//! OAuth2 store, and the real provider/minter/cache wiring.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::AsyncRead;
use tower::ServiceExt;

use grid_gateway::cluster::tools::SchedulerToolHost;
use grid_gateway::cluster::{
    ActionTotals, JobAction, JobId, SchedulerClient, SecurityContext, DirectoryClient, ToolHost,
};
use grid_gateway::config::Config;
use grid_gateway::gateway::{AppState, Collaborators, Gateway, create_router};
use grid_gateway::{Error, Result};

/// In-memory scheduler double with hold/release semantics
pub struct MockScheduler {
    pub jobs: Mutex<BTreeMap<JobId, Value>>,
    next_cluster: AtomicU64,
}

impl Default for MockScheduler {
    fn default() -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            next_cluster: AtomicU64::new(1),
        }
    }
}

impl MockScheduler {
    /// Seed a cluster of `procs` idle jobs, returning its cluster id
    pub fn seed_cluster(&self, procs: u64) -> u64 {
        let cluster = self.next_cluster.fetch_add(1, Ordering::SeqCst);
        let mut jobs = self.jobs.lock();
        for proc in 0..procs {
            jobs.insert(
                JobId { cluster, proc },
                json!({
                    "ClusterId": cluster,
                    "ProcId": proc,
                    "JobStatus": 1,
                    "Held": false,
                }),
            );
        }
        cluster
    }

    fn matches(constraint: &str, id: JobId) -> bool {
        let trimmed = constraint.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            return true;
        }
        // Supports the `ClusterId == N` form the tests exercise
        if let Some(rest) = trimmed.strip_prefix("ClusterId") {
            let digits: String = rest.chars().filter(char::is_ascii_digit).collect();
            if let Ok(n) = digits.parse::<u64>() {
                return id.cluster == n;
            }
        }
        false
    }

    fn held(ad: &Value) -> bool {
        ad.get("Held").and_then(Value::as_bool).unwrap_or(false)
    }
}

#[async_trait]
impl SchedulerClient for MockScheduler {
    async fn query_jobs(
        &self,
        _ctx: &SecurityContext,
        constraint: &str,
        _projection: &[String],
    ) -> Result<Vec<Value>> {
        Ok(self
            .jobs
            .lock()
            .iter()
            .filter(|(id, _)| Self::matches(constraint, **id))
            .map(|(_, ad)| ad.clone())
            .collect())
    }

    async fn get_job(&self, _ctx: &SecurityContext, id: JobId) -> Result<Value> {
        self.jobs
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("job {id} nonexistent")))
    }

    async fn submit_job(&self, _ctx: &SecurityContext, description: Value) -> Result<JobId> {
        let cluster = self.next_cluster.fetch_add(1, Ordering::SeqCst);
        let id = JobId { cluster, proc: 0 };
        let mut ad = json!({
            "ClusterId": cluster,
            "ProcId": 0,
            "JobStatus": 1,
            "Held": false,
        });
        if let (Some(obj), Some(desc)) = (ad.as_object_mut(), description.as_object()) {
            for (k, v) in desc {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.jobs.lock().insert(id, ad);
        Ok(id)
    }

    async fn act_on_job(
        &self,
        _ctx: &SecurityContext,
        id: JobId,
        action: JobAction,
        _reason: Option<&str>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let protected = match jobs.get(&id) {
            Some(ad) => ad.get("Protected").and_then(Value::as_bool).unwrap_or(false),
            None => return Err(Error::Internal(format!("job {id} nonexistent"))),
        };
        if protected {
            return Err(Error::Internal("job is protected".to_string()));
        }
        match action {
            JobAction::Remove => {
                jobs.remove(&id);
            }
            JobAction::Hold => {
                if let Some(ad) = jobs.get_mut(&id) {
                    ad["Held"] = json!(true);
                }
            }
            JobAction::Release => {
                if let Some(ad) = jobs.get_mut(&id) {
                    ad["Held"] = json!(false);
                }
            }
        }
        Ok(())
    }

    async fn act_on_constraint(
        &self,
        _ctx: &SecurityContext,
        constraint: &str,
        action: JobAction,
        _reason: Option<&str>,
    ) -> Result<ActionTotals> {
        let mut jobs = self.jobs.lock();
        let matched: Vec<JobId> = jobs
            .keys()
            .copied()
            .filter(|id| Self::matches(constraint, *id))
            .collect();
        let mut totals = ActionTotals {
            total: matched.len() as u64,
            ..Default::default()
        };
        for id in matched {
            match action {
                JobAction::Remove => {
                    jobs.remove(&id);
                    totals.success += 1;
                }
                JobAction::Hold => {
                    let ad = jobs.get_mut(&id).expect("matched id present");
                    if Self::held(ad) {
                        totals.already_done += 1;
                    } else {
                        ad["Held"] = json!(true);
                        totals.success += 1;
                    }
                }
                JobAction::Release => {
                    let ad = jobs.get_mut(&id).expect("matched id present");
                    if Self::held(ad) {
                        ad["Held"] = json!(false);
                        totals.success += 1;
                    } else {
                        totals.already_done += 1;
                    }
                }
            }
        }
        Ok(totals)
    }

    async fn edit_job(
        &self,
        _ctx: &SecurityContext,
        id: JobId,
        attributes: &[(String, String)],
    ) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let Some(ad) = jobs.get_mut(&id) else {
            return Err(Error::Internal(format!("job {id} nonexistent")));
        };
        for (name, rendered) in attributes {
            ad[name.as_str()] = json!(rendered);
        }
        Ok(())
    }

    async fn edit_constraint(
        &self,
        ctx: &SecurityContext,
        constraint: &str,
        attributes: &[(String, String)],
    ) -> Result<ActionTotals> {
        let matched: Vec<JobId> = self
            .jobs
            .lock()
            .keys()
            .copied()
            .filter(|id| Self::matches(constraint, *id))
            .collect();
        let mut totals = ActionTotals {
            total: matched.len() as u64,
            ..Default::default()
        };
        for id in matched {
            self.edit_job(ctx, id, attributes).await?;
            totals.success += 1;
        }
        Ok(totals)
    }

    async fn upload_sandbox(&self, _ctx: &SecurityContext, id: JobId, tar: Bytes) -> Result<()> {
        let mut jobs = self.jobs.lock();
        let Some(ad) = jobs.get_mut(&id) else {
            return Err(Error::Internal(format!("job {id} nonexistent")));
        };
        ad["SandboxBytes"] = json!(tar.len());
        Ok(())
    }

    async fn download_sandbox(
        &self,
        _ctx: &SecurityContext,
        id: JobId,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        if !self.jobs.lock().contains_key(&id) {
            return Err(Error::Internal(format!("job {id} nonexistent")));
        }
        Ok(Box::new(std::io::Cursor::new(b"tar-bytes".to_vec())))
    }
}

/// Directory double advertising one scheduler
pub struct MockDirectory;

#[async_trait]
impl DirectoryClient for MockDirectory {
    async fn query_ads(&self, ad_type: Option<&str>, name: Option<&str>) -> Result<Vec<Value>> {
        let ad = json!({
            "MyType": ad_type.unwrap_or("scheduler"),
            "Name": name.unwrap_or("sched@cluster.test"),
            "address": "http://sched.cluster.test:9618",
        });
        Ok(vec![ad])
    }

    async fn locate_scheduler(&self, _name: Option<&str>) -> Result<Option<String>> {
        Ok(Some("http://sched.cluster.test:9618".to_string()))
    }
}

/// A booted gateway over mocks, plus the handles tests poke at
pub struct TestGateway {
    pub app: Router,
    pub state: Arc<AppState>,
    pub scheduler: Arc<MockScheduler>,
    _store_dir: tempfile::TempDir,
}

/// Default test configuration: provider + minter wired, trusted proxy
/// header enabled, generous rate limits
pub fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.provider.issuer_url = Some("https://gw.test".to_string());
    config.provider.store_path = Some(dir.path().join("oauth2.db"));
    config.provider.signing_key_dir = Some(dir.path().join("keys"));
    config.provider.user_header = Some("x-remote-user".to_string());
    config.downstream.trust_domain = Some("cluster.test".to_string());
    config.downstream.identity_domain = Some("users.test".to_string());
    config.rate_limit.scheduler_query_rate = 100;
    config.rate_limit.scheduler_query_burst = 200;
    config.rate_limit.directory_query_rate = 100;
    config.rate_limit.directory_query_burst = 200;
    config
}

/// Boot the router with a customized configuration
pub async fn gateway_with(customize: impl FnOnce(&mut Config)) -> TestGateway {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir);
    customize(&mut config);

    let scheduler = Arc::new(MockScheduler::default());
    let tool_host: Arc<dyn ToolHost> = Arc::new(SchedulerToolHost::new(
        Arc::clone(&scheduler) as Arc<dyn SchedulerClient>
    ));
    let collaborators = Collaborators {
        scheduler: Arc::clone(&scheduler) as Arc<dyn SchedulerClient>,
        directory: Some(Arc::new(MockDirectory) as Arc<dyn DirectoryClient>),
        tool_host,
        reconcilable: None,
    };

    let gateway = Gateway::new(config, collaborators);
    let (state, _store) = gateway.build_state(None).await.expect("state");
    let app = create_router(Arc::clone(&state));

    TestGateway {
        app,
        state,
        scheduler,
        _store_dir: dir,
    }
}

/// Boot with the default configuration
pub async fn gateway() -> TestGateway {
    gateway_with(|_| {}).await
}

// ----------------------------------------------------------------------
// HTTP helpers
// ----------------------------------------------------------------------

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.expect("infallible")
}

pub async fn get(app: &Router, path: &str) -> Response<Body> {
    send(
        app,
        Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("request"),
    )
    .await
}

pub async fn get_bearer(app: &Router, path: &str, token: &str) -> Response<Body> {
    send(
        app,
        Request::builder()
            .uri(path)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request"),
    )
    .await
}

pub async fn post_form(app: &Router, path: &str, fields: &[(&str, &str)]) -> Response<Body> {
    let body = serde_urlencoded::to_string(fields).expect("encode form");
    send(
        app,
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .expect("request"),
    )
    .await
}

pub async fn request_json(
    app: &Router,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: &Value,
) -> Response<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    send(
        app,
        builder
            .body(Body::from(body.to_string()))
            .expect("request"),
    )
    .await
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
}

// ----------------------------------------------------------------------
// OAuth2 helpers
// ----------------------------------------------------------------------

/// Register a confidential client, returning (client_id, client_secret)
pub async fn register_client(
    app: &Router,
    scopes: &str,
    grant_types: &[&str],
) -> (String, String) {
    let response = request_json(
        app,
        "POST",
        "/oauth2/register",
        None,
        &json!({
            "redirect_uris": ["https://app.test/cb"],
            "client_name": "test client",
            "grant_types": grant_types,
            "scope": scopes,
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    (
        body["client_id"].as_str().expect("client_id").to_string(),
        body["client_secret"]
            .as_str()
            .expect("client_secret")
            .to_string(),
    )
}

/// Obtain an access token via client_credentials for the given scopes
pub async fn token_with_scopes(app: &Router, scopes: &str) -> String {
    let (client_id, client_secret) =
        register_client(app, scopes, &["client_credentials"]).await;
    let response = post_form(
        app,
        "/oauth2/token",
        &[
            ("grant_type", "client_credentials"),
            ("client_id", &client_id),
            ("client_secret", &client_secret),
            ("scope", scopes),
        ],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    body["access_token"]
        .as_str()
        .expect("access_token")
        .to_string()
}

/// Location header of a redirect response
pub fn location_of(response: &Response<Body>) -> String {
    response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .expect("location header")
        .to_string()
}

/// Extract one query parameter from a URL
pub fn query_param(url: &str, key: &str) -> Option<String> {
    url::Url::parse(url).ok().and_then(|u| {
        u.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.to_string())
    })
}
