use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use gateway::{FileSystem, JobEngine, MemoryStore, UploadSessionService};
use models::{DriverKind, Mount, Principal, StorageConfig, WebdavPolicy};
use scheduler::{CleanupUploadSessions, Dispatcher, DispatcherConfig, Registry, ScheduledSyncCopy};
use serve::auth::AuthConfig;
use serve::AppState;
use std::sync::Arc;
use storage::{OpContext, UploadBody};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "root-token";

struct Fixture {
    router: Router,
    fs: Arc<FileSystem>,
    _dirs: Vec<tempfile::TempDir>,
}

async fn fixture() -> Fixture {
    let store = MemoryStore::new();
    let mut dirs = Vec::new();
    for i in 0..2 {
        let dir = tempfile::tempdir().unwrap();
        store
            .put_storage_config(StorageConfig {
                id: format!("s{i}"),
                kind: DriverKind::Local,
                config: serde_json::json!({ "rootPath": dir.path().to_string_lossy() }),
                is_public: true,
                is_default: i == 0,
                owner_id: "admin".into(),
            })
            .await;
        store
            .put_mount(Mount {
                id: format!("m{i}"),
                mount_path: format!("/m{i}"),
                storage_config_id: format!("s{i}"),
                cache_ttl: 0,
                web_proxy: true,
                webdav_policy: WebdavPolicy::Redirect,
                owner: "admin".into(),
                sign_secret: "proxy-secret".into(),
                created_at: chrono::Utc::now(),
                last_used_at: None,
            })
            .await;
        dirs.push(dir);
    }

    let shutdown = CancellationToken::new();
    let fs = Arc::new(FileSystem::new(store.clone()));
    let jobs = JobEngine::new(store.clone(), fs.clone(), shutdown.clone());
    let sessions = Arc::new(UploadSessionService::new(fs.clone(), store.clone()));
    let registry = Registry::new().register(CleanupUploadSessions).register(ScheduledSyncCopy);
    let dispatcher = Dispatcher::new(
        registry,
        store.clone(),
        store.clone(),
        jobs.clone(),
        DispatcherConfig::default(),
    );

    let state = AppState {
        fs: fs.clone(),
        jobs,
        sessions,
        dispatcher,
        auth: Arc::new(AuthConfig {
            admin_token: Some(ADMIN_TOKEN.to_string()),
            api_keys: Vec::new(),
        }),
    };
    Fixture { router: serve::router(state), fs, _dirs: dirs }
}

fn admin() -> Principal {
    Principal::Admin { id: "root".into() }
}

fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"));
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };
    builder.body(body).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn bytes_body(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap().to_vec()
}

#[tokio::test]
async fn test_missing_credentials_forbidden() {
    let fixture = fixture().await;
    let response = fixture
        .router
        .oneshot(Request::get("/api/fs/list?path=/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_virtual_root_listing_envelope() {
    let fixture = fixture().await;
    let response =
        fixture.router.oneshot(request("GET", "/api/fs/list?path=/", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["code"], "OK");
    assert_eq!(body["data"]["isVirtual"], true);
    assert_eq!(body["data"]["isRoot"], true);
    let names: Vec<_> = body["data"]["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| i["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["m0", "m1"]);
}

#[tokio::test]
async fn test_download_single_byte_range() {
    let fixture = fixture().await;
    let ctx = OpContext::default();
    fixture
        .fs
        .write(&admin(), "/m0/a/b.txt", UploadBody::from_bytes(&b"hello world"[..]), true, &ctx)
        .await
        .unwrap();

    let req = Request::get("/api/fs/download?path=/m0/a/b.txt")
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .header(header::RANGE, "bytes=0-0")
        .body(Body::empty())
        .unwrap();
    let response = fixture.router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 0-0/11");
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "1");
    assert_eq!(bytes_body(response).await, b"h");

    // Unbounded tail range.
    let req = Request::get("/api/fs/download?path=/m0/a/b.txt")
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .header(header::RANGE, "bytes=6-")
        .body(Body::empty())
        .unwrap();
    let response = fixture.router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(bytes_body(response).await, b"world");

    // Past-EOF start is unsatisfiable.
    let req = Request::get("/api/fs/download?path=/m0/a/b.txt")
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .header(header::RANGE, "bytes=50-60")
        .body(Body::empty())
        .unwrap();
    let response = fixture.router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */11");
}

#[tokio::test]
async fn test_signed_proxy_read() {
    let fixture = fixture().await;
    let ctx = OpContext::default();
    fixture
        .fs
        .write(&admin(), "/m0/a/b.txt", UploadBody::from_bytes(&b"hello world"[..]), true, &ctx)
        .await
        .unwrap();

    // Mint a link, then fetch through the public proxy without credentials.
    let response = fixture
        .router
        .clone()
        .oneshot(request("GET", "/api/fs/file-link?path=/m0/a/b.txt&expiresIn=300", None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["data"]["type"], "proxy");
    let url = body["data"]["url"].as_str().unwrap().to_string();

    let response = fixture
        .router
        .clone()
        .oneshot(Request::get(url.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");
    assert_eq!(bytes_body(response).await, b"hello world");

    // Tampering with the signature is rejected.
    let bad = url.replace("sign=", "sign=x");
    let response = fixture
        .router
        .clone()
        .oneshot(Request::get(bad.as_str()).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_cross_storage_copy_job_over_http() {
    let fixture = fixture().await;
    let ctx = OpContext::default();
    fixture
        .fs
        .write(&admin(), "/m0/x.bin", UploadBody::from_bytes(&b"x-bytes"[..]), true, &ctx)
        .await
        .unwrap();

    let create = serde_json::json!({
        "taskType": "copy",
        "items": [{ "sourcePath": "/m0/x.bin", "targetPath": "/m1/x.bin" }],
        "options": { "skipExisting": true, "maxConcurrency": 4 },
    });
    let response = fixture
        .router
        .clone()
        .oneshot(request("POST", "/api/fs/jobs", Some(create.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let job_id = body["data"]["id"].as_str().unwrap().to_string();

    let mut done = serde_json::Value::Null;
    for _ in 0..200 {
        let response = fixture
            .router
            .clone()
            .oneshot(request("GET", &format!("/api/fs/jobs/{job_id}"), None))
            .await
            .unwrap();
        let body = json_body(response).await;
        let status = body["data"]["status"].as_str().unwrap().to_string();
        if ["succeeded", "failed", "cancelled"].contains(&status.as_str()) {
            done = body;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(done["data"]["status"], "succeeded");
    assert_eq!(done["data"]["stats"]["success"], 1);
    assert_eq!(done["data"]["stats"]["skipped"], 0);
    assert_eq!(done["data"]["stats"]["failed"], 0);
    assert_eq!(done["data"]["stats"]["total"], 1);

    // The identical request again skips the existing target.
    let response = fixture
        .router
        .clone()
        .oneshot(request("POST", "/api/fs/jobs", Some(create)))
        .await
        .unwrap();
    let body = json_body(response).await;
    let job_id = body["data"]["id"].as_str().unwrap().to_string();
    for _ in 0..200 {
        let response = fixture
            .router
            .clone()
            .oneshot(request("GET", &format!("/api/fs/jobs/{job_id}"), None))
            .await
            .unwrap();
        let body = json_body(response).await;
        if body["data"]["status"] == "succeeded" {
            assert_eq!(body["data"]["stats"]["skipped"], 1);
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("second job did not finish");
}

#[tokio::test]
async fn test_scheduled_admin_round_trip() {
    let fixture = fixture().await;

    let response = fixture
        .router
        .clone()
        .oneshot(request("GET", "/api/admin/scheduled/types", None))
        .await
        .unwrap();
    let body = json_body(response).await;
    let ids: Vec<_> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|h| h["id"].as_str().unwrap().to_string())
        .collect();
    assert!(ids.contains(&"cleanup_upload_sessions".to_string()));
    assert!(ids.contains(&"scheduled_sync_copy".to_string()));

    let create = serde_json::json!({
        "taskId": "cleanup-1",
        "handlerId": "cleanup_upload_sessions",
        "name": "nightly cleanup",
        "scheduleType": "interval",
        "intervalSec": 3600,
        "config": { "keepDays": 30, "activeGraceHours": 24 },
    });
    let response = fixture
        .router
        .clone()
        .oneshot(request("POST", "/api/admin/scheduled/jobs", Some(create)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Manual run: trigger recorded, summary in the audit row.
    let response = fixture
        .router
        .clone()
        .oneshot(request("POST", "/api/admin/scheduled/jobs/cleanup-1/run", None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["data"]["status"], "success");
    assert_eq!(body["data"]["trigger"], "manual");
    assert_eq!(body["data"]["summary"], "标记过期会话 0 条，删除历史会话 0 条");

    let response = fixture
        .router
        .clone()
        .oneshot(request("GET", "/api/admin/scheduled/jobs/cleanup-1/runs", None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let response = fixture
        .router
        .clone()
        .oneshot(request("GET", "/api/admin/scheduled/analytics?windowHours=24", None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["data"]["totalRuns"], 1);
    assert_eq!(body["data"]["totalFailures"], 0);

    // Invalid cron on create is VALIDATION.
    let bad = serde_json::json!({
        "taskId": "bad-cron",
        "handlerId": "cleanup_upload_sessions",
        "name": "broken",
        "scheduleType": "cron",
        "cronExpression": "not a cron",
    });
    let response = fixture
        .router
        .clone()
        .oneshot(request("POST", "/api/admin/scheduled/jobs", Some(bad)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["code"], "VALIDATION");
}

#[tokio::test]
async fn test_rename_and_batch_remove_over_http() {
    let fixture = fixture().await;
    let ctx = OpContext::default();
    fixture
        .fs
        .write(&admin(), "/m0/old.txt", UploadBody::from_bytes(&b"1"[..]), true, &ctx)
        .await
        .unwrap();

    let response = fixture
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/fs/rename",
            Some(serde_json::json!({ "oldPath": "/m0/old.txt", "newPath": "/m0/new.txt" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = fixture
        .router
        .clone()
        .oneshot(request(
            "DELETE",
            "/api/fs/batch-remove",
            Some(serde_json::json!({ "paths": ["/m0/new.txt", "/m0/ghost.txt"] })),
        ))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["data"]["successes"], 1);
    assert_eq!(body["data"]["failures"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_path_length_cap() {
    let fixture = fixture().await;
    let long = "a".repeat(3000);
    let response = fixture
        .router
        .oneshot(request("GET", &format!("/api/fs/get?path=/m0/{long}"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["code"], "VALIDATION");
}
