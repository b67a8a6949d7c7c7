use async_trait::async_trait;
use docvault::config::{Config, ReaperConfig};
use docvault::embedding::{EmbeddingClient, EmbeddingClientError, LocalHashClient};
use docvault::extraction::DocumentInput;
use docvault::retrieval::SearchOptions;
use docvault::service::{RagService, ServiceError, SessionApi};
use docvault::session::ManualClock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const THRESHOLD: Duration = Duration::from_secs(300);

const NOTES: &str = "Board notes for Q2 2024. Revenue rose to $85 million and the \
                     operating margin improved to 14.2% after the warehouse consolidation.";

async fn setup(dir: &TempDir) -> (Arc<RagService>, Arc<ManualClock>) {
    setup_with(dir, Arc::new(LocalHashClient::new(64))).await
}

async fn setup_with(
    dir: &TempDir,
    client: Arc<dyn EmbeddingClient>,
) -> (Arc<RagService>, Arc<ManualClock>) {
    let config = Config {
        storage_dir: dir.path().to_path_buf(),
        reaper: ReaperConfig {
            interval: Duration::from_millis(20),
            inactivity_threshold: THRESHOLD,
        },
        ..Config::default()
    };
    let clock = Arc::new(ManualClock::default());
    let service = RagService::with_components(&config, client, clock.clone())
        .await
        .expect("service");
    (Arc::new(service), clock)
}

#[tokio::test]
async fn reaper_deletes_only_sessions_past_threshold() {
    let dir = TempDir::new().expect("tempdir");
    let (service, clock) = setup(&dir).await;
    let idle = service.create_session().await.expect("create");
    clock.advance(Duration::from_secs(120));
    let recent = service.create_session().await.expect("create");

    clock.advance(Duration::from_secs(180));
    assert_eq!(service.sweep_inactive(Some(THRESHOLD)).await, 0);

    clock.advance(Duration::from_secs(1));
    assert_eq!(service.sweep_inactive(Some(THRESHOLD)).await, 1);
    assert!(service.session_info(idle).await.is_none());
    assert!(service.session_info(recent).await.is_some());
    assert_eq!(service.metrics_snapshot().sessions_reaped, 1);
}

#[tokio::test]
async fn query_just_before_sweep_keeps_session_alive() {
    let dir = TempDir::new().expect("tempdir");
    let (service, clock) = setup(&dir).await;
    let session = service.create_session().await.expect("create");
    service
        .ingest(session, vec![DocumentInput::new("notes.txt", NOTES)])
        .await
        .expect("ingest");

    clock.advance(THRESHOLD - Duration::from_secs(1));
    service
        .search(session, "operating margin", SearchOptions::default())
        .await
        .expect("search");
    clock.advance(Duration::from_secs(2));

    assert_eq!(service.sweep_inactive(None).await, 0);
    assert!(service.session_info(session).await.is_some());

    clock.advance(THRESHOLD);
    assert_eq!(service.sweep_inactive(None).await, 1);
    assert!(service.session_info(session).await.is_none());
}

#[tokio::test]
async fn deleted_session_is_gone_everywhere() {
    let dir = TempDir::new().expect("tempdir");
    let (service, _) = setup(&dir).await;
    let session = service.create_session().await.expect("create");
    service
        .ingest(session, vec![DocumentInput::new("notes.txt", NOTES)])
        .await
        .expect("ingest");
    let storage = dir.path().join(session.to_string());
    assert!(storage.join("manifest.json").is_file());

    assert!(service.delete_session(session).await.expect("delete"));
    assert!(!storage.exists());
    assert!(service.session_info(session).await.is_none());
    assert!(matches!(
        service
            .search(session, "revenue", SearchOptions::default())
            .await,
        Err(ServiceError::SessionNotFound(id)) if id == session
    ));
    assert!(matches!(
        service
            .ingest(session, vec![DocumentInput::new("late.txt", NOTES)])
            .await,
        Err(ServiceError::SessionNotFound(_))
    ));
    assert!(!service.delete_session(session).await.expect("second delete"));
}

#[tokio::test]
async fn concurrent_searches_during_delete_never_see_partial_state() {
    let dir = TempDir::new().expect("tempdir");
    let (service, _) = setup(&dir).await;
    let session = service.create_session().await.expect("create");
    service
        .ingest(session, vec![DocumentInput::new("notes.txt", NOTES)])
        .await
        .expect("ingest");

    let searches: Vec<_> = (0..8)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .search(session, "revenue", SearchOptions::default())
                    .await
            })
        })
        .collect();
    let deleted = service.delete_session(session).await.expect("delete");
    assert!(deleted);

    for handle in searches {
        match handle.await.expect("join") {
            Ok(results) => assert!(!results.is_empty()),
            Err(error) => assert!(matches!(error, ServiceError::SessionNotFound(_))),
        }
    }
}

#[tokio::test]
async fn scheduled_reaper_runs_until_cancelled() {
    let dir = TempDir::new().expect("tempdir");
    let (service, clock) = setup(&dir).await;
    let session = service.create_session().await.expect("create");
    clock.advance(THRESHOLD + Duration::from_secs(1));

    let shutdown = CancellationToken::new();
    let handle = service.reaper().spawn(shutdown.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while service.session_info(session).await.is_some() && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(service.session_info(session).await.is_none());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("reaper stops")
        .expect("join");
}

#[tokio::test]
async fn restarting_discards_previous_sessions() {
    let dir = TempDir::new().expect("tempdir");
    let session = {
        let (service, _) = setup(&dir).await;
        let session = service.create_session().await.expect("create");
        service
            .ingest(session, vec![DocumentInput::new("notes.txt", NOTES)])
            .await
            .expect("ingest");
        session
    };
    assert!(dir.path().join(session.to_string()).exists());

    let (service, _) = setup(&dir).await;
    assert!(service.session_info(session).await.is_none());
    assert!(!dir.path().join(session.to_string()).exists());
}

/// Parks the first embedding call until the test releases it.
struct GatedClient {
    inner: LocalHashClient,
    gated: AtomicBool,
    started: Notify,
    release: Notify,
}

impl GatedClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalHashClient::new(64),
            gated: AtomicBool::new(false),
            started: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl EmbeddingClient for GatedClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if !self.gated.swap(true, Ordering::SeqCst) {
            self.started.notify_one();
            self.release.notified().await;
        }
        self.inner.generate_embeddings(texts).await
    }
}

fn long_report(pages: usize) -> String {
    (1..=pages)
        .map(|page| format!("Page {page}. {NOTES}"))
        .collect::<Vec<_>>()
        .join("\x0C")
}

#[tokio::test]
async fn sweep_started_during_ingest_keeps_the_session() {
    let dir = TempDir::new().expect("tempdir");
    let (service, clock) = setup(&dir).await;
    let session = service.create_session().await.expect("create");
    clock.advance(THRESHOLD + Duration::from_secs(1));

    let ingest = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .ingest(session, vec![DocumentInput::new("long.txt", long_report(400))])
                .await
        })
    };
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    assert_eq!(service.sweep_inactive(None).await, 0);
    let report = ingest.await.expect("join").expect("ingest survives the sweep");
    assert!(report.embedded > 0);
    assert!(service.session_info(session).await.is_some());
    assert!(dir.path().join(session.to_string()).is_dir());
}

#[tokio::test]
async fn sweep_waits_for_ingest_in_flight() {
    let dir = TempDir::new().expect("tempdir");
    let client = GatedClient::new();
    let (service, clock) = setup_with(&dir, client.clone()).await;
    let session = service.create_session().await.expect("create");
    clock.advance(THRESHOLD + Duration::from_secs(1));

    let ingest = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .ingest(session, vec![DocumentInput::new("notes.txt", NOTES)])
                .await
        })
    };
    client.started.notified().await;

    let sweep = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.sweep_inactive(None).await })
    };
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert!(!sweep.is_finished());

    client.release.notify_one();
    let report = ingest.await.expect("join").expect("ingest");
    assert!(report.embedded > 0);
    assert_eq!(sweep.await.expect("join"), 0);

    let info = service.session_info(session).await.expect("session kept");
    assert_eq!(info.chunk_count, report.total_chunks);
}

#[tokio::test]
async fn delete_waits_for_ingest_in_flight() {
    let dir = TempDir::new().expect("tempdir");
    let client = GatedClient::new();
    let (service, _) = setup_with(&dir, client.clone()).await;
    let session = service.create_session().await.expect("create");

    let ingest = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .ingest(session, vec![DocumentInput::new("notes.txt", NOTES)])
                .await
        })
    };
    client.started.notified().await;

    let delete = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.delete_session(session).await })
    };
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    assert!(!delete.is_finished());
    assert!(dir.path().join(session.to_string()).is_dir());

    client.release.notify_one();
    let report = ingest.await.expect("join").expect("ingest completes before the delete");
    assert!(report.embedded > 0);
    assert!(delete.await.expect("join").expect("delete"));

    assert!(service.session_info(session).await.is_none());
    assert!(!dir.path().join(session.to_string()).exists());
}
