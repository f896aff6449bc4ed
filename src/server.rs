//! Result server
//!
//! A small HTTP endpoint on loopback that spawned test processes call back
//! into: `start` before running, `failure` per failing test, `report` at the
//! end. Reports land in the shared [`FailureLedger`].
//!
//! The daemon binds an ephemeral port and publishes the bound address in
//! `AUTOTEST_SERVER` and in its session's address file.

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::AutotestError;
use crate::file_index::normalize_path;
use crate::ledger::{FailureLedger, LedgerSnapshot};

/// Environment variable through which children learn the server address
pub const SERVER_ENV: &str = "AUTOTEST_SERVER";

/// Any free port on loopback
pub const LOOPBACK_ANY: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub file: String,
    pub class_name: String,
    pub method_name: String,
}

#[derive(Debug)]
struct SinkState {
    /// The next `start` clears the ledger
    armed: bool,
    /// Reports are applied; false between a reset and the next spawn
    open: bool,
}

/// The operations a reporting child can invoke
#[derive(Debug)]
pub struct ResultSink {
    ledger: Arc<FailureLedger>,
    root: PathBuf,
    state: Mutex<SinkState>,
}

impl ResultSink {
    pub fn new(ledger: Arc<FailureLedger>, root: &Path) -> Self {
        Self {
            ledger,
            root: root.to_path_buf(),
            state: Mutex::new(SinkState { armed: false, open: true }),
        }
    }

    pub fn ledger(&self) -> &Arc<FailureLedger> {
        &self.ledger
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accept reports again and let the next `start` clear the ledger.
    /// Called once per spawned command.
    pub fn arm(&self) {
        let mut state = self.lock();
        state.armed = true;
        state.open = true;
    }

    /// Drop every report until the next [`ResultSink::arm`]. Reports already
    /// being applied finish before this returns.
    pub fn close(&self) {
        let mut state = self.lock();
        state.armed = false;
        state.open = false;
    }

    pub fn start(&self) {
        let mut state = self.lock();
        if !state.open {
            tracing::debug!("SERVER: start from a cancelled session, ignored");
        } else if std::mem::take(&mut state.armed) {
            tracing::debug!("SERVER: starting, clearing ledger");
            self.ledger.clear();
        } else {
            tracing::debug!("SERVER: starting (same session)");
        }
    }

    pub fn report_failure(&self, file: &str, class_name: &str, method_name: &str) {
        let file = self.relative(file);
        let state = self.lock();
        if !state.open {
            tracing::debug!(file, class_name, method_name, "SERVER: late failure report ignored");
            return;
        }
        tracing::debug!(file, class_name, method_name, "SERVER: failure");
        self.ledger.record_failure(&file, class_name, method_name);
    }

    pub fn report_done(&self) {
        tracing::debug!("SERVER: done");
    }

    pub fn status(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    fn relative(&self, file: &str) -> String {
        let path = Path::new(file);
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        normalize_path(&rel.to_string_lossy())
    }
}

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ResultServer {
    requested: SocketAddr,
    sink: Arc<ResultSink>,
    address_file: Option<PathBuf>,
    running: Option<Running>,
}

impl ResultServer {
    pub fn new(addr: SocketAddr, sink: Arc<ResultSink>) -> Self {
        Self {
            requested: addr,
            sink,
            address_file: None,
            running: None,
        }
    }

    /// Publish the bound address at `path` while running
    pub fn with_address_file(mut self, path: PathBuf) -> Self {
        self.address_file = Some(path);
        self
    }

    pub fn sink(&self) -> &Arc<ResultSink> {
        &self.sink
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    /// Bind and serve in the background. A second call while running is a no-op.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(ref running) = self.running {
            return Ok(running.addr);
        }

        if let Some(path) = &self.address_file {
            refuse_live_address(path).await?;
        }

        let listener = tokio::net::TcpListener::bind(self.requested)
            .await
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::AddrInUse => anyhow::Error::new(AutotestError::AddressInUse {
                    addr: self.requested,
                    source,
                }),
                _ => anyhow::Error::new(source).context(format!("Failed to bind result server on {}", self.requested)),
            })?;
        let addr = listener.local_addr().context("Failed to read result server address")?;

        let app = router(self.sink.clone());
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::error!("result server stopped unexpectedly: {}", e);
            }
        });

        tracing::info!(%addr, "result server listening");
        self.running = Some(Running { addr, shutdown, task });

        if let Some(path) = self.address_file.clone() {
            if let Err(e) = fs::write(&path, addr.to_string()) {
                self.stop().await;
                return Err(anyhow::Error::new(e).context(format!("Failed to write {}", path.display())));
            }
        }

        Ok(addr)
    }

    /// Shut down and wait for the listener to close. Safe to call when not running.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(());
            if let Err(e) = running.task.await {
                tracing::warn!("result server task ended abnormally: {}", e);
            }
            tracing::info!(addr = %running.addr, "result server stopped");

            if let Some(path) = &self.address_file {
                let _ = fs::remove_file(path);
            }
        }
    }
}

/// An address file whose server still answers means another daemon owns this session.
async fn refuse_live_address(path: &Path) -> Result<()> {
    let Ok(content) = fs::read_to_string(path) else {
        return Ok(());
    };
    let Ok(addr) = content.trim().parse::<SocketAddr>() else {
        return Ok(());
    };

    if tokio::net::TcpStream::connect(addr).await.is_ok() {
        return Err(AutotestError::AddressInUse {
            addr,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        }
        .into());
    }

    tracing::debug!(path = %path.display(), "replacing stale address file");
    Ok(())
}

fn router(sink: Arc<ResultSink>) -> Router {
    Router::new()
        .route("/start", post(start_handler))
        .route("/failure", post(failure_handler))
        .route("/report", post(report_handler))
        .route("/status", get(status_handler))
        .with_state(sink)
}

async fn start_handler(State(sink): State<Arc<ResultSink>>) -> StatusCode {
    sink.start();
    StatusCode::NO_CONTENT
}

async fn failure_handler(State(sink): State<Arc<ResultSink>>, Json(report): Json<FailureReport>) -> StatusCode {
    sink.report_failure(&report.file, &report.class_name, &report.method_name);
    StatusCode::NO_CONTENT
}

async fn report_handler(State(sink): State<Arc<ResultSink>>) -> StatusCode {
    sink.report_done();
    StatusCode::NO_CONTENT
}

async fn status_handler(State(sink): State<Arc<ResultSink>>) -> impl IntoResponse {
    Json(sink.status())
}

/// Client side of the protocol, used by `redgreen report` and by tests
#[derive(Debug, Clone)]
pub struct ReporterClient {
    base: String,
    http: reqwest::Client,
}

impl ReporterClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            base: format!("http://{}", addr),
            http: reqwest::Client::new(),
        }
    }

    /// Address published by a daemon's result server
    pub fn from_address_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("No result server address at {} (is redgreen running?)", path.display()))?;
        let addr: SocketAddr = content
            .trim()
            .parse()
            .with_context(|| format!("{} does not hold a socket address", path.display()))?;
        Ok(Self::new(addr))
    }

    /// Server of the daemon running as `session` on this machine
    pub fn for_session(session: u32) -> Result<Self> {
        Self::from_address_file(&crate::session::address_file(&std::env::temp_dir(), session))
    }

    /// Address from `AUTOTEST_SERVER`
    pub fn from_env() -> Result<Self> {
        let value = std::env::var(SERVER_ENV).with_context(|| format!("{} is not set", SERVER_ENV))?;
        let addr: SocketAddr = value
            .parse()
            .with_context(|| format!("{} is not a socket address: {}", SERVER_ENV, value))?;
        Ok(Self::new(addr))
    }

    pub async fn start(&self) -> Result<()> {
        self.post("start", None).await
    }

    pub async fn failure(&self, file: &str, class_name: &str, method_name: &str) -> Result<()> {
        let report = FailureReport {
            file: file.to_string(),
            class_name: class_name.to_string(),
            method_name: method_name.to_string(),
        };
        self.post("failure", Some(&report)).await
    }

    pub async fn done(&self) -> Result<()> {
        self.post("report", None).await
    }

    pub async fn status(&self) -> Result<LedgerSnapshot> {
        let url = format!("{}/status", self.base);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach result server at {}", self.base))?
            .error_for_status()?;
        response.json().await.context("Failed to decode ledger status")
    }

    async fn post(&self, path: &str, body: Option<&FailureReport>) -> Result<()> {
        let url = format!("{}/{}", self.base, path);
        let mut request = self.http.post(&url);
        if let Some(body) = body {
            request = request.json(body);
        }

        request
            .send()
            .await
            .with_context(|| format!("Failed to reach result server at {}", self.base))?
            .error_for_status()
            .with_context(|| format!("Result server rejected /{}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn any_port() -> SocketAddr {
        LOOPBACK_ANY
    }

    fn server(addr: SocketAddr, ledger: Arc<FailureLedger>) -> ResultServer {
        ResultServer::new(addr, Arc::new(ResultSink::new(ledger, Path::new("/p"))))
    }

    #[tokio::test]
    async fn test_sessions_get_distinct_published_addresses() {
        let base = TempDir::new().unwrap();
        let first_file = crate::session::address_file(base.path(), 1234);
        let second_file = crate::session::address_file(base.path(), 21234);
        fs::create_dir_all(first_file.parent().unwrap()).unwrap();
        fs::create_dir_all(second_file.parent().unwrap()).unwrap();

        let mut first = server(any_port(), Arc::new(FailureLedger::new())).with_address_file(first_file.clone());
        let mut second = server(any_port(), Arc::new(FailureLedger::new())).with_address_file(second_file.clone());
        let a = first.start().await.unwrap();
        let b = second.start().await.unwrap();

        assert_ne!(a, b);
        assert!(a.ip().is_loopback());
        assert_eq!(fs::read_to_string(&first_file).unwrap(), a.to_string());

        let client = ReporterClient::from_address_file(&second_file).unwrap();
        assert!(client.status().await.is_ok());

        first.stop().await;
        second.stop().await;
        assert!(!first_file.exists());
        assert!(ReporterClient::from_address_file(&first_file).is_err());
    }

    #[tokio::test]
    async fn test_refuses_session_owned_by_live_server() {
        let base = TempDir::new().unwrap();
        let path = base.path().join("server.addr");

        let mut first = server(any_port(), Arc::new(FailureLedger::new())).with_address_file(path.clone());
        first.start().await.unwrap();

        let mut second = server(any_port(), Arc::new(FailureLedger::new())).with_address_file(path.clone());
        let err = second.start().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AutotestError>(),
            Some(AutotestError::AddressInUse { .. })
        ));

        first.stop().await;

        // a leftover file from a dead daemon is replaced
        fs::write(&path, "127.0.0.1:1").unwrap();
        let addr = second.start().await.unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), addr.to_string());
        second.stop().await;
    }

    #[test]
    fn test_closed_sink_drops_late_reports() {
        let ledger = Arc::new(FailureLedger::new());
        let sink = ResultSink::new(ledger.clone(), Path::new("/p"));

        sink.arm();
        sink.close();
        ledger.clear();
        sink.start();
        sink.report_failure("test/a_test.rb", "ATest", "test_1");
        assert!(ledger.is_all_good());

        sink.arm();
        sink.report_failure("test/a_test.rb", "ATest", "test_1");
        assert!(!ledger.is_all_good());
    }

    #[test]
    fn test_sink_normalizes_paths() {
        let ledger = Arc::new(FailureLedger::new());
        let sink = ResultSink::new(ledger.clone(), Path::new("/home/dev/project"));

        sink.report_failure("/home/dev/project/test/foo_test.rb", "FooTest", "test_a");
        sink.report_failure("./test/bar_test.rb", "BarTest", "test_b");
        sink.report_failure("/elsewhere/baz_test.rb", "BazTest", "test_c");

        let snap = ledger.snapshot();
        let files: Vec<_> = snap.failures.keys().cloned().collect();
        assert_eq!(files, vec!["/elsewhere/baz_test.rb", "test/bar_test.rb", "test/foo_test.rb"]);
        assert!(snap.tainted);
    }

    #[test]
    fn test_only_first_start_of_a_session_clears() {
        let ledger = Arc::new(FailureLedger::new());
        let sink = ResultSink::new(ledger.clone(), Path::new("/p"));

        ledger.ensure_tracked("test/a_test.rb");
        sink.arm();
        sink.start();
        assert!(ledger.is_all_good());

        sink.report_failure("test/a_test.rb", "ATest", "test_1");
        sink.start();
        assert!(!ledger.is_all_good());
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let ledger = Arc::new(FailureLedger::new());
        let mut server = server(any_port(), ledger.clone());
        let addr = server.start().await.unwrap();
        let client = ReporterClient::new(addr);

        ledger.ensure_tracked("test/stale_test.rb");
        server.sink().arm();

        client.start().await.unwrap();
        client.failure("/p/test/bar_test.rb", "BarTest", "test_x").await.unwrap();
        client.failure("/p/test/bar_test.rb", "BarTest", "test_x").await.unwrap();
        client.done().await.unwrap();

        let status = client.status().await.unwrap();
        assert!(status.tainted);
        assert_eq!(status.failures.len(), 1);
        assert_eq!(status.failures["test/bar_test.rb"]["BarTest"].len(), 1);
        assert_eq!(status, ledger.snapshot());

        server.stop().await;
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_restartable() {
        let ledger = Arc::new(FailureLedger::new());
        let mut server = server(any_port(), ledger);

        let first = server.start().await.unwrap();
        let again = server.start().await.unwrap();
        assert_eq!(first, again);

        server.stop().await;
        server.stop().await;

        let restarted = server.start().await.unwrap();
        assert!(ReporterClient::new(restarted).status().await.is_ok());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_refuses_address_in_use() {
        let mut first = server(any_port(), Arc::new(FailureLedger::new()));
        let addr = first.start().await.unwrap();

        let mut second = server(addr, Arc::new(FailureLedger::new()));
        let err = second.start().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AutotestError>(),
            Some(AutotestError::AddressInUse { .. })
        ));

        first.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_error() {
        let mut server = server(any_port(), Arc::new(FailureLedger::new()));
        let addr = server.start().await.unwrap();
        server.stop().await;

        assert!(ReporterClient::new(addr).start().await.is_err());
    }
}
