//! REST job surface tests: bulk semantics, error mapping, sandboxes,
//! unauthenticated directory queries

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{
    body_bytes, body_json, gateway, get, get_bearer, request_json, send, token_with_scopes,
};

#[tokio::test]
async fn bulk_hold_reports_totals_then_already_done() {
    let gw = gateway().await;
    let cluster = gw.scheduler.seed_cluster(3);
    let token = token_with_scopes(&gw.app, "scheduler:/WRITE").await;
    let body = json!({"constraint": format!("ClusterId == {cluster}")});

    let response = request_json(&gw.app, "POST", "/api/v1/jobs/hold", Some(&token), &body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["results"]["total"], 3);
    assert_eq!(payload["results"]["success"], 3);
    assert_eq!(payload["constraint"], format!("ClusterId == {cluster}"));

    // Second hold finds everything already held
    let response = request_json(&gw.app, "POST", "/api/v1/jobs/hold", Some(&token), &body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["results"]["already_done"], 3);
    assert_eq!(payload["results"]["success"], 0);

    // Release flips them back
    let response =
        request_json(&gw.app, "POST", "/api/v1/jobs/release", Some(&token), &body).await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["results"]["success"], 3);
}

#[tokio::test]
async fn bulk_with_no_matches_is_not_found() {
    let gw = gateway().await;
    let token = token_with_scopes(&gw.app, "scheduler:/WRITE").await;

    let response = request_json(
        &gw.app,
        "DELETE",
        "/api/v1/jobs",
        Some(&token),
        &json!({"constraint": "ClusterId == 424242"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let payload = body_json(response).await;
    assert_eq!(payload["message"], "No jobs matched the constraint");
}

#[tokio::test]
async fn bulk_with_empty_constraint_is_bad_request() {
    let gw = gateway().await;
    let token = token_with_scopes(&gw.app, "scheduler:/WRITE").await;

    let response = request_json(
        &gw.app,
        "POST",
        "/api/v1/jobs/hold",
        Some(&token),
        &json!({"constraint": ""}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bulk_edit_applies_attributes() {
    let gw = gateway().await;
    let cluster = gw.scheduler.seed_cluster(2);
    let token = token_with_scopes(&gw.app, "scheduler:/WRITE").await;

    let response = request_json(
        &gw.app,
        "PATCH",
        "/api/v1/jobs",
        Some(&token),
        &json!({
            "constraint": format!("ClusterId == {cluster}"),
            "attributes": {"JobPrio": 5},
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["results"]["success"], 2);

    let jobs = gw.scheduler.jobs.lock();
    // Attribute values arrive rendered as expressions
    assert!(jobs.values().all(|ad| ad["JobPrio"] == "5"));
}

#[tokio::test]
async fn list_and_get_jobs() {
    let gw = gateway().await;
    let cluster = gw.scheduler.seed_cluster(2);
    let token = token_with_scopes(&gw.app, "scheduler:/READ").await;

    let response = get_bearer(&gw.app, "/api/v1/jobs", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let jobs = body_json(response).await;
    assert_eq!(jobs.as_array().unwrap().len(), 2);

    let response = get_bearer(&gw.app, &format!("/api/v1/jobs/{cluster}.0"), &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let ad = body_json(response).await;
    assert_eq!(ad["ProcId"], 0);
}

#[tokio::test]
async fn scheduler_error_strings_map_to_http_codes() {
    let gw = gateway().await;
    let token = token_with_scopes(&gw.app, "scheduler:/WRITE").await;

    // Nonexistent job
    let response = get_bearer(&gw.app, "/api/v1/jobs/99.0", &token).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Protected job reports 403
    let cluster = gw.scheduler.seed_cluster(1);
    gw.scheduler.jobs.lock().values_mut().for_each(|ad| {
        ad["Protected"] = json!(true);
    });
    let response = send(
        &gw.app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/jobs/{cluster}.0"))
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_job_id_is_bad_request() {
    let gw = gateway().await;
    let token = token_with_scopes(&gw.app, "scheduler:/READ").await;
    let response = get_bearer(&gw.app, "/api/v1/jobs/not-an-id", &token).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn submit_then_hold_single_job() {
    let gw = gateway().await;
    let token = token_with_scopes(&gw.app, "scheduler:/WRITE").await;

    let response = request_json(
        &gw.app,
        "POST",
        "/api/v1/jobs",
        Some(&token),
        &json!({"Cmd": "/bin/sleep", "Args": "60"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let payload = body_json(response).await;
    let job_id = payload["job_id"].as_str().unwrap().to_string();

    let response = request_json(
        &gw.app,
        "POST",
        &format!("/api/v1/jobs/{job_id}/hold"),
        Some(&token),
        &json!({"reason": "maintenance"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let id: grid_gateway::cluster::JobId = job_id.parse().unwrap();
    assert_eq!(gw.scheduler.jobs.lock()[&id]["Held"], true);
}

#[tokio::test]
async fn sandbox_upload_and_download_roundtrip() {
    let gw = gateway().await;
    let cluster = gw.scheduler.seed_cluster(1);
    let token = token_with_scopes(&gw.app, "scheduler:/WRITE").await;

    let response = send(
        &gw.app,
        Request::builder()
            .method("PUT")
            .uri(format!("/api/v1/jobs/{cluster}.0/input"))
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/x-tar")
            .body(Body::from(vec![0u8; 1024]))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = get_bearer(&gw.app, &format!("/api/v1/jobs/{cluster}.0/output"), &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/x-tar")
    );
    let bytes = body_bytes(response).await;
    assert_eq!(&bytes[..], b"tar-bytes");
}

#[tokio::test]
async fn directory_queries_never_require_auth() {
    let gw = gateway().await;

    let response = get(&gw.app, "/api/v1/directory/ads").await;
    assert_eq!(response.status(), StatusCode::OK);
    let ads = body_json(response).await;
    assert_eq!(ads.as_array().unwrap().len(), 1);

    let response = get(&gw.app, "/api/v1/directory/ads/scheduler").await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = get(&gw.app, "/api/v1/directory/ads/scheduler/sched%40cluster.test").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_ready_metrics_and_openapi_are_public() {
    let gw = gateway().await;

    let response = get(&gw.app, "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    let response = get(&gw.app, "/readyz").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ready");

    let response = get(&gw.app, "/metrics").await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = get(&gw.app, "/openapi.json").await;
    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await;
    assert_eq!(doc["openapi"], "3.0.3");
    assert!(doc["paths"]["/api/v1/jobs"].is_object());
}
