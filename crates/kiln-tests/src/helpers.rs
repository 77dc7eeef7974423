//! Test helper functions and utilities.

use futures::{SinkExt, StreamExt};
use kiln_api::build_app;
use kiln_api::config::{Account, DispatchSettings, MasterConfig};
use kiln_api::state::AppState;
use kiln_core::builder::{BuilderConfig, BuilderSet};
use kiln_core::ids::RequestId;
use kiln_core::ports::{EventBus, ResultStore};
use kiln_core::protocol::{AssignFrame, MasterFrame, WorkerFrame};
use kiln_db::{Database, SqliteResultStore};
use kiln_scheduler::backoff::RetryPolicy;
use kiln_scheduler::bus::LocalEventBus;
use kiln_scheduler::{ChangeIngest, DispatchConfig, Dispatcher, Scheduler, WorkerRegistry};
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::fixtures::test_registration;

/// Shared secret every test worker presents.
pub const TEST_CREDENTIAL: &str = "kiln-test-secret";
/// Operator account baked into every test master.
pub const TEST_USERNAME: &str = "admin";
pub const TEST_PASSWORD: &str = "hunter2";

/// A complete in-process master: HTTP API, worker socket, dispatch loop,
/// and a throwaway SQLite store. Dropping it tears everything down.
pub struct TestMaster {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    shutdown: watch::Sender<bool>,
    server: tokio::task::JoinHandle<()>,
    _data_dir: tempfile::TempDir,
}

impl TestMaster {
    /// WebSocket URL of the worker endpoint.
    pub fn worker_url(&self) -> String {
        format!("ws://{}/ws/worker", self.addr)
    }

    /// WebSocket URL of the event stream endpoint.
    pub fn events_url(&self) -> String {
        format!("ws://{}/ws/events", self.addr)
    }
}

impl Drop for TestMaster {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.server.abort();
    }
}

/// Start a master over a temporary SQLite database and return it ready to
/// serve requests. Dispatch runs with [`test_dispatch_config`] pacing so
/// tests settle fast.
pub async fn start_test_master(builders: Vec<BuilderConfig>) -> anyhow::Result<TestMaster> {
    crate::init_test_logging();

    let data_dir = tempfile::tempdir()?;
    let db_path = data_dir.path().join("kiln-test.sqlite");
    let db_url = format!("sqlite://{}", db_path.display());
    let database = Database::connect(&db_url).await?;
    database.migrate().await?;

    let config = Arc::new(MasterConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        db_url,
        title: "Kiln Test".to_string(),
        external_url: None,
        worker_credential: TEST_CREDENTIAL.to_string(),
        accounts: vec![Account {
            username: TEST_USERNAME.to_string(),
            password: TEST_PASSWORD.to_string(),
        }],
        dispatch: DispatchSettings::default(),
        builders: builders.clone(),
    });

    let builder_set = Arc::new(BuilderSet::from_configs(builders)?);
    let store: Arc<dyn ResultStore> = Arc::new(SqliteResultStore::new(database.pool().clone()));
    let event_bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::default());
    let registry = Arc::new(WorkerRegistry::new(TEST_CREDENTIAL));
    let dispatcher = Arc::new(Dispatcher::new(
        builder_set.clone(),
        registry.clone(),
        store.clone(),
        event_bus.clone(),
        test_dispatch_config(),
    ));
    let scheduler = Arc::new(Scheduler::new(builder_set.clone(), dispatcher.clone()));
    let ingest = Arc::new(ChangeIngest::new(scheduler.clone(), event_bus.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(dispatcher.clone().run(shutdown_rx));

    let state = Arc::new(AppState {
        config,
        builders: builder_set,
        registry,
        dispatcher,
        scheduler,
        ingest,
        store,
        event_bus,
    });

    let app = build_app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    // Give the server time to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    Ok(TestMaster {
        addr,
        state,
        shutdown: shutdown_tx,
        server,
        _data_dir: data_dir,
    })
}

/// Dispatch pacing tuned for tests: fast ticks, short ack and cancel
/// windows, near-immediate retry backoff.
pub fn test_dispatch_config() -> DispatchConfig {
    DispatchConfig {
        ack_timeout_secs: 2,
        cancel_grace_secs: 2,
        tick_interval_ms: 25,
        heartbeat_timeout_secs: 60,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 200,
        },
    }
}

/// Create an HTTP client for testing.
pub fn test_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to create test client")
}

/// API test client with base URL.
pub struct ApiTestClient {
    client: Client,
    base_url: String,
}

impl ApiTestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            client: test_client(),
            base_url: format!("http://{}", addr),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client.get(self.url(path)).send().await
    }

    pub async fn post<T: serde::Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> reqwest::Result<reqwest::Response> {
        self.client.post(self.url(path)).json(body).send().await
    }

    /// POST with the test operator's credentials and no body.
    pub async fn post_authed(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(self.url(path))
            .basic_auth(TEST_USERNAME, Some(TEST_PASSWORD))
            .send()
            .await
    }

    /// POST a JSON body with the test operator's credentials.
    pub async fn post_authed_json<T: serde::Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(self.url(path))
            .basic_auth(TEST_USERNAME, Some(TEST_PASSWORD))
            .json(body)
            .send()
            .await
    }

    /// Number of workers the master currently knows.
    pub async fn worker_count(&self) -> anyhow::Result<usize> {
        let resp = self.get("/api/v1/workers").await?;
        let body: serde_json::Value = resp.json().await?;
        Ok(body["total"].as_u64().unwrap_or(0) as usize)
    }

    /// Poll until a build shows up in the result store, returning its JSON.
    pub async fn wait_for_build(
        &self,
        builder: &str,
        number: u32,
        timeout: Duration,
    ) -> anyhow::Result<serde_json::Value> {
        let path = format!("/api/v1/builders/{builder}/builds/{number}");
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            let resp = self.get(&path).await?;
            if resp.status().is_success() {
                return Ok(resp.json().await?);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("build {builder} #{number} never appeared")
    }
}

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// A scripted worker client for driving the wire protocol from tests.
///
/// Connects and performs the hello handshake; after that the test decides
/// exactly which frames the worker sends and when.
pub struct TestWorker {
    ws: WsClient,
}

impl TestWorker {
    /// Connect and register under `name`. Returns the worker together with
    /// the master's first reply (`Welcome` or `Denied`).
    pub async fn connect(
        addr: SocketAddr,
        name: &str,
        credential: &str,
    ) -> anyhow::Result<(Self, MasterFrame)> {
        let url = format!("ws://{}/ws/worker", addr);
        let (ws, _) = connect_async(&url).await?;
        let mut worker = Self { ws };
        worker
            .send(&WorkerFrame::Hello(test_registration(name, credential)))
            .await?;
        let first = worker.next_frame().await?;
        Ok((worker, first))
    }

    pub async fn send(&mut self, frame: &WorkerFrame) -> anyhow::Result<()> {
        let json = serde_json::to_string(frame)?;
        self.ws.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Next master frame, waiting up to five seconds. Non-text messages
    /// are skipped.
    pub async fn next_frame(&mut self) -> anyhow::Result<MasterFrame> {
        match tokio::time::timeout(FRAME_TIMEOUT, self.read_frame()).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("timed out waiting for a master frame"),
        }
    }

    async fn read_frame(&mut self) -> anyhow::Result<MasterFrame> {
        while let Some(message) = self.ws.next().await {
            if let Message::Text(text) = message? {
                return Ok(serde_json::from_str(&text)?);
            }
        }
        anyhow::bail!("connection closed while waiting for a master frame")
    }

    /// Wait for an assignment, letting any other frames pass.
    pub async fn expect_assign(&mut self) -> anyhow::Result<AssignFrame> {
        for _ in 0..10 {
            if let MasterFrame::Assign(order) = self.next_frame().await? {
                return Ok(order);
            }
        }
        anyhow::bail!("no assignment arrived")
    }

    /// Wait for a cancellation, letting any other frames pass.
    pub async fn expect_cancel(&mut self) -> anyhow::Result<RequestId> {
        for _ in 0..10 {
            if let MasterFrame::Cancel { request_id } = self.next_frame().await? {
                return Ok(request_id);
            }
        }
        anyhow::bail!("no cancellation arrived")
    }

    /// Close the connection cleanly.
    pub async fn close(mut self) -> anyhow::Result<()> {
        self.ws.send(Message::Close(None)).await?;
        Ok(())
    }
}

/// Wait for a condition with timeout.
pub async fn wait_for<F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut condition: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_immediate() {
        let result = wait_for(
            Duration::from_secs(1),
            Duration::from_millis(10),
            || async { true },
        )
        .await;
        assert!(result);
    }

    #[tokio::test]
    async fn test_wait_for_timeout() {
        let result = wait_for(
            Duration::from_millis(100),
            Duration::from_millis(10),
            || async { false },
        )
        .await;
        assert!(!result);
    }
}
