//! Standalone regression tests.
//!
//! Drives the full HTTP surface: builds a catalog through the management
//! API, then polls the Omaha endpoint the way an update client does.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use chrono::Utc;
use rollgate_core::ChannelAliases;
use rollgate_omaha::{Handler, Response};
use rollgate_rollout::{Controller, ControllerConfig};
use rollgate_state::*;
use serde_json::{Value, json};
use tower::ServiceExt;

const APP: &str = "e96281a6-d1af-4bde-9a0a-97b76e56dc57";
const GROUP: &str = "5b810680-e36a-4879-b98a-4f989e80b899";

fn test_router() -> Router {
    let store = StateStore::open_in_memory().unwrap();
    let controller = Controller::new(store, ControllerConfig::default());
    rollgate_api::build_router(Handler::new(controller, ChannelAliases::default()))
}

async fn post_json(router: &Router, uri: &str, body: Value) -> StatusCode {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    router.clone().oneshot(req).await.unwrap().status()
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn seed_catalog(router: &Router, package_id: Option<&str>) {
    let now = Utc::now();
    assert_eq!(
        post_json(
            router,
            "/api/v1/apps",
            json!({ "id": APP, "name": "Flatcar Container Linux", "created_ts": now }),
        )
        .await,
        StatusCode::CREATED
    );
    assert_eq!(
        post_json(
            router,
            "/api/v1/packages",
            json!({
                "id": "pkg-101",
                "application_id": APP,
                "package_type": "flatcar",
                "version": "1.0.1",
                "url": "https://update.release.example.com/amd64-usr/1.0.1/",
                "filename": "flatcar_production_update.gz",
                "size": "465881871",
                "hash": "r3nufcxgMTZaxYEqL+x2zIoeClk=",
                "channels_blacklist": [],
                "arch": "amd64",
                "flatcar_action": {
                    "event": "postinstall",
                    "sha256": "LIkAKVZY2EJFiwTmltiJZLFLA5xT/FodbjVgqkyF/y8=",
                    "needs_admin": false,
                    "is_delta": false,
                    "disable_payload_backoff": true
                },
                "created_ts": now
            }),
        )
        .await,
        StatusCode::CREATED
    );
    assert_eq!(
        post_json(
            router,
            "/api/v1/channels",
            json!({
                "id": "ch-stable",
                "name": "stable",
                "application_id": APP,
                "package_id": package_id,
                "arch": "amd64",
                "created_ts": now
            }),
        )
        .await,
        StatusCode::CREATED
    );
    let mut group = Group::new(GROUP, APP, "Stable", now);
    group.channel_id = Some("ch-stable".to_string());
    assert_eq!(
        post_json(router, "/api/v1/groups", serde_json::to_value(&group).unwrap()).await,
        StatusCode::CREATED
    );
}

async fn omaha(router: &Router, body: String) -> (StatusCode, String) {
    let req = Request::builder()
        .method("POST")
        .uri("/v1/update/")
        .header("content-type", "text/xml")
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::from(body))
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

fn update_check(machine: &str, version: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<request protocol="3.0" version="update_engine-0.4.10" ismachine="1">
  <os version="Chateau" platform="CoreOS" sp="{version}_x86_64" arch="x64"></os>
  <app appid="{{{APP}}}" version="{version}" track="{GROUP}" machineid="{machine}" board="amd64-usr" lang="en-US">
    <ping active="1" a="-1" r="-1"></ping>
    <updatecheck></updatecheck>
  </app>
</request>"#
    )
}

fn report(machine: &str, version: &str, event_type: u32, result: u32, previous: &str) -> String {
    format!(
        r#"<request protocol="3.0">
  <app appid="{APP}" version="{version}" track="{GROUP}" machineid="{machine}">
    <event eventtype="{event_type}" eventresult="{result}" previousversion="{previous}"></event>
  </app>
</request>"#
    )
}

#[tokio::test]
async fn standalone_health() {
    let router = test_router();
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn standalone_outdated_instance_is_offered_update() {
    let router = test_router();
    seed_catalog(&router, Some("pkg-101")).await;

    let (status, xml) = omaha(&router, update_check("m-1", "1.0.0")).await;
    assert_eq!(status, StatusCode::OK);
    let resp = Response::from_xml(&xml).unwrap();
    let app = &resp.apps[0];
    assert_eq!(app.status, "ok");
    let check = app.update_check.as_ref().unwrap();
    assert_eq!(check.status, "ok");
    assert_eq!(check.urls.as_ref().unwrap().urls.len(), 1);
    assert_eq!(check.manifest.as_ref().unwrap().version, "1.0.1");

    let (status, body) = get_json(&router, "/api/v1/instances/m-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["ip"], "203.0.113.9");
}

#[tokio::test]
async fn standalone_current_instance_gets_no_update() {
    let router = test_router();
    seed_catalog(&router, Some("pkg-101")).await;

    let (_, xml) = omaha(&router, update_check("m-1", "1.0.1")).await;
    let resp = Response::from_xml(&xml).unwrap();
    assert_eq!(resp.apps[0].status, "ok");
    assert!(resp.apps[0].update_check.is_none());
}

#[tokio::test]
async fn standalone_missing_package_reports_token_and_activity() {
    let router = test_router();
    seed_catalog(&router, None).await;

    for machine in ["m-1", "m-2", "m-3"] {
        let (_, xml) = omaha(&router, update_check(machine, "1.0.0")).await;
        let resp = Response::from_xml(&xml).unwrap();
        let check = resp.apps[0].update_check.as_ref().unwrap();
        assert_eq!(check.status, "error-noPackageFound");
    }

    let (status, body) = get_json(&router, "/api/v1/activity").await;
    assert_eq!(status, StatusCode::OK);
    let entries = body["data"].as_array().unwrap();
    let not_found = entries
        .iter()
        .filter(|e| e["class"] == "package_not_found")
        .count();
    assert_eq!(not_found, 1);
}

#[tokio::test]
async fn standalone_update_cycle_completes() {
    let router = test_router();
    seed_catalog(&router, Some("pkg-101")).await;

    omaha(&router, update_check("m-1", "1.0.0")).await;
    for (event_type, result) in [(13, 1), (14, 1), (800, 1)] {
        let (status, xml) = omaha(&router, report("m-1", "1.0.0", event_type, result, "")).await;
        assert_eq!(status, StatusCode::OK);
        let resp = Response::from_xml(&xml).unwrap();
        assert_eq!(resp.apps[0].events.len(), 1);
    }
    omaha(&router, report("m-1", "1.0.1", 3, 2, "1.0.1")).await;

    let (status, body) = get_json(
        &router,
        &format!("/api/v1/instances/m-1/apps/{APP}/history"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["application"]["status"], "complete");
    assert_eq!(body["data"]["application"]["version"], "1.0.1");
    assert_eq!(body["data"]["events"].as_array().unwrap().len(), 4);

    let (_, body) = get_json(&router, &format!("/api/v1/groups/{GROUP}/stats")).await;
    assert_eq!(body["data"]["total_instances"], 1);
    assert_eq!(body["data"]["updates_to_current_version_succeeded"], 1);

    let (_, body) = get_json(&router, &format!("/api/v1/groups/{GROUP}")).await;
    assert_eq!(body["data"]["rollout_in_progress"], false);
}

#[tokio::test]
async fn standalone_failed_canary_disables_group() {
    let router = test_router();
    seed_catalog(&router, Some("pkg-101")).await;
    let (_, body) = get_json(&router, &format!("/api/v1/groups/{GROUP}")).await;
    let mut group = body["data"].clone();
    group["policy_safe_mode"] = json!(true);
    assert_eq!(post_json(&router, "/api/v1/groups", group).await, StatusCode::CREATED);

    omaha(&router, update_check("m-1", "1.0.0")).await;
    let (_, xml) = omaha(&router, update_check("m-2", "1.0.0")).await;
    let resp = Response::from_xml(&xml).unwrap();
    assert_eq!(
        resp.apps[0].update_check.as_ref().unwrap().status,
        "error-maxUpdatesPerPeriodLimitReached"
    );

    omaha(&router, report("m-1", "1.0.0", 3, 0, "")).await;

    let (_, body) = get_json(&router, &format!("/api/v1/groups/{GROUP}")).await;
    assert_eq!(body["data"]["policy_updates_enabled"], false);
    let (_, body) = get_json(&router, "/api/v1/activity").await;
    assert!(
        body["data"]
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["class"] == "rollout_failed")
    );

    let (_, xml) = omaha(&router, update_check("m-3", "1.0.0")).await;
    let resp = Response::from_xml(&xml).unwrap();
    assert_eq!(
        resp.apps[0].update_check.as_ref().unwrap().status,
        "error-updatesDisabled"
    );
}

#[tokio::test]
async fn standalone_malformed_request_is_rejected() {
    let router = test_router();
    let (status, _) = omaha(&router, "<request><app appid=".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn standalone_bad_event_code_keeps_request_alive() {
    let router = test_router();
    seed_catalog(&router, Some("pkg-101")).await;
    let body = format!(
        r#"<request protocol="3.0">
  <app appid="{APP}" version="1.0.0" track="{GROUP}" machineid="m-1"><updatecheck/></app>
  <app appid="{APP}" version="1.0.0" track="{GROUP}" machineid="m-2"><event eventtype="x" eventresult="1"/></app>
</request>"#
    );
    let (status, xml) = omaha(&router, body).await;
    assert_eq!(status, StatusCode::OK);
    let resp = Response::from_xml(&xml).unwrap();
    assert_eq!(resp.apps.len(), 2);
    assert_eq!(resp.apps[0].update_check.as_ref().unwrap().status, "ok");
    assert_eq!(resp.apps[1].events.len(), 1);
}

#[tokio::test]
async fn standalone_dangling_reference_is_rejected() {
    let router = test_router();
    let group = Group::new(GROUP, "missing-app", "Stable", Utc::now());
    assert_eq!(
        post_json(&router, "/api/v1/groups", serde_json::to_value(&group).unwrap()).await,
        StatusCode::BAD_REQUEST
    );
}
