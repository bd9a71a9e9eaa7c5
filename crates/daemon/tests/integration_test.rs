#![cfg(unix)]

use preview_common::{ErrorResponse, GeneratePreviewRequest, GeneratePreviewResponse, InstanceInfo, LeaseInfo, StopRequest};
use preview_daemon::api::{self, AppState};
use preview_daemon::db;
use preview_daemon::launcher::{Launcher, LauncherConfig, ReadinessMarker};
use preview_daemon::registry::{PortRegistry, SqliteLeaseStore};
use preview_daemon::source::DirDeckSource;
use preview_daemon::Supervisor;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct TestDaemon {
    base_url: String,
    supervisor: Arc<Supervisor>,
    content: TempDir,
    _work: TempDir,
}

/// Serves the API on an ephemeral port, with `sh` standing in for the renderer.
async fn start_daemon(renderer_script: &str) -> TestDaemon {
    let content = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();

    let registry = PortRegistry::new(
        Arc::new(SqliteLeaseStore::new(db::init_db(&work.path().join("ports.db")).unwrap())),
        1024,
        u16::MAX,
    );
    let launcher = Launcher::new(LauncherConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), renderer_script.to_string(), "renderer".to_string()],
        marker: ReadinessMarker::default(),
        startup_timeout: Duration::from_secs(10),
    });
    let supervisor = Arc::new(Supervisor::new(
        registry,
        launcher,
        work.path().join("decks"),
        Duration::from_secs(600),
    ));

    let app = api::router(AppState {
        supervisor: supervisor.clone(),
        source: Arc::new(DirDeckSource::new(content.path())),
        public_host: "preview.test".to_string(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    TestDaemon {
        base_url: format!("http://{addr}"),
        supervisor,
        content,
        _work: work,
    }
}

const RENDERER: &str = r#"echo "  > http://localhost:$3/"; exec sleep 60"#;

#[tokio::test]
async fn test_full_lifecycle() {
    let daemon = start_daemon(RENDERER).await;
    std::fs::write(daemon.content.path().join("quarterly.md"), "# Q3").unwrap();
    let client = Client::new();

    // 1. Generate
    let resp = client
        .post(format!("{}/generate-preview", daemon.base_url))
        .json(&GeneratePreviewRequest { filename: "quarterly".to_string() })
        .send()
        .await
        .expect("Failed to send preview request");
    assert_eq!(resp.status(), StatusCode::OK);
    let first: GeneratePreviewResponse = resp.json().await.unwrap();
    assert_eq!(first.port, 1024);
    assert_eq!(first.preview_url, "http://preview.test:1024");

    // 2. Same deck again reuses the renderer
    let second: GeneratePreviewResponse = client
        .post(format!("{}/generate-preview", daemon.base_url))
        .json(&GeneratePreviewRequest { filename: "quarterly".to_string() })
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second.port, first.port);

    // 3. Listings
    let instances: Vec<InstanceInfo> = client
        .get(format!("{}/instances", daemon.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].deck, "quarterly");

    let leases: Vec<LeaseInfo> = client
        .get(format!("{}/leases", daemon.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].port, first.port);
    assert_eq!(leases[0].deck, "quarterly");

    // 4. Stop
    let resp = client
        .post(format!("{}/stop", daemon.base_url))
        .json(&StopRequest { filename: "quarterly".to_string() })
        .send()
        .await
        .expect("Failed to stop");
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(daemon.supervisor.instances().is_empty());
    assert!(daemon.supervisor.registry().leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_content_starts_nothing() {
    let daemon = start_daemon(RENDERER).await;
    let client = Client::new();

    let resp = client
        .post(format!("{}/generate-preview", daemon.base_url))
        .json(&GeneratePreviewRequest { filename: "nowhere".to_string() })
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: ErrorResponse = resp.json().await.unwrap();
    assert!(body.message.starts_with("Failed to update preview"));

    assert!(daemon.supervisor.instances().is_empty());
    assert!(daemon.supervisor.registry().leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_deck_is_rejected() {
    let daemon = start_daemon(RENDERER).await;
    let resp = Client::new()
        .post(format!("{}/generate-preview", daemon.base_url))
        .json(&GeneratePreviewRequest { filename: "../secrets".to_string() })
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn launch_failure_returns_renderer_output() {
    let daemon = start_daemon("echo 'Error: bad frontmatter' >&2; exit 1").await;
    std::fs::write(daemon.content.path().join("broken.md"), "---\n---").unwrap();

    let resp = Client::new()
        .post(format!("{}/generate-preview", daemon.base_url))
        .json(&GeneratePreviewRequest { filename: "broken".to_string() })
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorResponse = resp.json().await.unwrap();
    assert!(body.details.unwrap_or_default().contains("bad frontmatter"));
    assert!(daemon.supervisor.registry().leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn only_post_generates_previews() {
    let daemon = start_daemon(RENDERER).await;
    let resp = Client::new()
        .get(format!("{}/generate-preview", daemon.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn shutdown_stops_every_renderer() {
    let daemon = start_daemon(RENDERER).await;
    let client = Client::new();
    for name in ["a", "b"] {
        std::fs::write(daemon.content.path().join(format!("{name}.md")), "# deck").unwrap();
        let resp = client
            .post(format!("{}/generate-preview", daemon.base_url))
            .json(&GeneratePreviewRequest { filename: name.to_string() })
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
    }

    assert_eq!(daemon.supervisor.shutdown().await, 2);
    assert!(daemon.supervisor.instances().is_empty());
    assert!(daemon.supervisor.registry().leases().await.unwrap().is_empty());
}
