use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use strata_cache::{CacheManager, LocalTier, LocalTierConfig, MemoryTier};
use strata_server::store::MemoryUserStore;
use strata_server::{AppState, UserService, build_app};
use tokio::task::JoinHandle;

struct TestServer {
    base: String,
    local: Arc<LocalTier>,
    distributed: Arc<MemoryTier>,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

async fn start_server() -> TestServer {
    let local = Arc::new(
        LocalTier::new(
            &LocalTierConfig {
                shards: 4,
                max_entries: 256,
                clean_interval_ms: 0,
                ..Default::default()
            },
            Duration::from_secs(60),
        )
        .expect("local tier"),
    );
    let distributed = Arc::new(MemoryTier::new());
    let cache = CacheManager::builder()
        .local(local.clone())
        .distributed(distributed.clone())
        .build();
    let service = UserService::new(
        Arc::new(cache),
        Arc::new(MemoryUserStore::new()),
        Duration::from_secs(60),
        Duration::from_secs(1),
    );
    let app = build_app(AppState { service });

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    TestServer {
        base: format!("http://{addr}/api/v1"),
        local,
        distributed,
        shutdown: tx,
        handle,
    }
}

async fn create(client: &reqwest::Client, base: &str, body: Value) -> reqwest::Response {
    client
        .post(format!("{base}/users"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_reports_tiers() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["cache"]["local"]["status"], "healthy");
    assert_eq!(body["cache"]["distributed"]["status"], "healthy");

    server.distributed.set_available(false);
    let body: Value = client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["cache"]["distributed"]["status"], "unhealthy");

    server.stop().await;
}

#[tokio::test]
async fn create_and_fetch_user_reports_source() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let resp = create(
        &client,
        &server.base,
        json!({ "username": "ada", "email": "ada@example.com" }),
    )
    .await;
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "User created successfully");
    let id = body["user"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["user"]["username"], "ada");

    let fetch = |client: reqwest::Client, url: String| async move {
        let resp = client.get(url).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        resp.json::<Value>().await.unwrap()
    };
    let url = format!("{}/users/{id}", server.base);

    let body = fetch(client.clone(), url.clone()).await;
    assert_eq!(body["source"], "local");
    assert_eq!(body["user"]["email"], "ada@example.com");

    server.local.reset();
    let body = fetch(client.clone(), url.clone()).await;
    assert_eq!(body["source"], "distributed");

    server.local.reset();
    server.distributed.clear();
    let body = fetch(client.clone(), url.clone()).await;
    assert_eq!(body["source"], "database");

    server.stop().await;
}

#[tokio::test]
async fn duplicate_email_conflicts() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let first = create(
        &client,
        &server.base,
        json!({ "username": "ada", "email": "ada@example.com" }),
    )
    .await;
    assert_eq!(first.status(), reqwest::StatusCode::CREATED);

    let second = create(
        &client,
        &server.base,
        json!({ "username": "ada2", "email": "ADA@example.com" }),
    )
    .await;
    assert_eq!(second.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["error"], "conflict");

    server.stop().await;
}

#[tokio::test]
async fn bad_requests() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let resp = create(&client, &server.base, json!({ "username": "", "email": "x@y" })).await;
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp = client
        .post(format!("{}/users", server.base))
        .header("content-type", "application/json")
        .body("{oops")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp = client
        .get(format!("{}/users/not-a-uuid", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp = client
        .get(format!("{}/users/{}", server.base, uuid_like()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn reads_survive_distributed_outage() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    let body: Value = create(
        &client,
        &server.base,
        json!({ "username": "grace", "email": "grace@example.com" }),
    )
    .await
    .json()
    .await
    .unwrap();
    let id = body["user"]["id"].as_str().unwrap().to_string();

    server.distributed.set_available(false);
    server.local.reset();

    let resp = client
        .get(format!("{}/users/{id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["source"], "database");

    let metrics: Value = client
        .get(format!("{}/cache/metrics", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(metrics["tiers"]["distributed"]["errors"].as_u64().unwrap() >= 1);

    server.stop().await;
}

fn uuid_like() -> &'static str {
    "00000000-0000-4000-8000-000000000000"
}
