//! Concurrent replay of captured connections
//!
//! One tokio task per client. Every task opens its own connection, arrives at
//! the shared [`StartGate`] and waits there until all peers have arrived and
//! the coordinator has released the gate. Statements of a client run strictly
//! in order; a failing client stops only its own remaining statements.
//!
//! The database is reached through [`ReplayBackend`] / [`ReplaySession`] so the
//! coordinator can run against PostgreSQL ([`PgBackend`]) or an in-memory
//! backend in tests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Statement};
use tracing::{debug, error, info, warn};

use crate::binding::{convert_params, natively_bindable, render_statement};
use crate::constants::{DEFAULT_READY_TIMEOUT, DEFAULT_REPLAY_TIMEOUT, INTERACTIONS_EXTENSION, UNRESOLVED_TYPE};
use crate::error::ReplayError;
use crate::interaction::{read_interactions, ReplayableStatement, TxControl};
use crate::metrics::LatencyHist;

// -----------------------------------------------------------------------------
// Start gate
// -----------------------------------------------------------------------------

/// Rendezvous point: workers arrive, the coordinator waits for all of them and
/// then releases everybody at once.
pub struct StartGate {
    expected: usize,
    ready: AtomicUsize,
    all_ready: Notify,
    release: watch::Sender<Option<Instant>>,
}

impl StartGate {
    pub fn new(expected: usize) -> Self {
        let (release, _) = watch::channel(None);
        Self {
            expected,
            ready: AtomicUsize::new(0),
            all_ready: Notify::new(),
            release,
        }
    }

    /// Signal that one worker is ready
    pub fn arrive(&self) {
        let now_ready = self.ready.fetch_add(1, Ordering::SeqCst) + 1;
        if now_ready >= self.expected {
            self.all_ready.notify_one();
        }
    }

    pub fn ready_count(&self) -> usize {
        self.ready.load(Ordering::SeqCst)
    }

    /// Resolves once every expected worker has arrived
    pub async fn wait_all_ready(&self) {
        while self.ready_count() < self.expected {
            self.all_ready.notified().await;
        }
    }

    /// Open the gate; returns the release instant
    pub fn release(&self) -> Instant {
        let now = Instant::now();
        self.release.send_replace(Some(now));
        now
    }

    pub fn released_at(&self) -> Option<Instant> {
        *self.release.borrow()
    }

    /// Block until the gate is released
    pub async fn wait_release(&self) -> Instant {
        let mut rx = self.release.subscribe();
        loop {
            if let Some(at) = *rx.borrow_and_update() {
                return at;
            }
            if rx.changed().await.is_err() {
                return Instant::now();
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Backend seam
// -----------------------------------------------------------------------------

/// Opens one session per replay client
#[async_trait]
pub trait ReplayBackend: Send + Sync {
    async fn connect(&self, client_id: u64) -> std::result::Result<Box<dyn ReplaySession>, ReplayError>;
}

/// One open database connection owned by a single worker
#[async_trait]
pub trait ReplaySession: Send {
    /// Run statement text over the simple protocol
    async fn simple(&mut self, sql: &str) -> std::result::Result<(), ReplayError>;

    /// Prepare (once per statement text), bind the captured values, execute
    async fn prepared(&mut self, stmt: &ReplayableStatement) -> std::result::Result<(), ReplayError>;

    async fn close(&mut self) -> std::result::Result<(), ReplayError>;
}

/// PostgreSQL via tokio-postgres
pub struct PgBackend {
    config: tokio_postgres::Config,
}

impl PgBackend {
    pub fn new(config: tokio_postgres::Config) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ReplayBackend for PgBackend {
    async fn connect(&self, client_id: u64) -> std::result::Result<Box<dyn ReplaySession>, ReplayError> {
        let (client, connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(|e| ReplayError::Connection(e.to_string()))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Client {}: PostgreSQL connection error: {}", client_id, e);
            }
        });

        Ok(Box::new(PgSession {
            client: Some(client),
            connection: Some(handle),
            statements: HashMap::new(),
        }))
    }
}

struct PgSession {
    client: Option<Client>,
    connection: Option<JoinHandle<()>>,
    /// Prepared statements keyed by captured statement text
    statements: HashMap<String, Statement>,
}

impl PgSession {
    fn client(&self) -> std::result::Result<&Client, ReplayError> {
        self.client
            .as_ref()
            .ok_or_else(|| ReplayError::Connection("session already closed".to_string()))
    }

    async fn prepare(&self, stmt: &ReplayableStatement) -> std::result::Result<Statement, ReplayError> {
        let client = self.client()?;
        let rendered = render_statement(&stmt.sql, &stmt.types);
        let prepared = client.prepare_typed(&rendered.sql, &rendered.declared).await?;
        if prepared.params().iter().all(natively_bindable) {
            return Ok(prepared);
        }

        // Server inferred a type we cannot bind for an unresolved slot: pin the
        // inferred types and let the server cast from text.
        let merged: Vec<u32> = prepared
            .params()
            .iter()
            .enumerate()
            .map(|(i, ty)| match stmt.types.get(i) {
                Some(oid) if *oid != UNRESOLVED_TYPE => *oid,
                _ => ty.oid(),
            })
            .collect();
        let rendered = render_statement(&stmt.sql, &merged);
        debug!("Re-preparing with server-inferred types: {}", rendered.sql);
        Ok(client.prepare_typed(&rendered.sql, &rendered.declared).await?)
    }
}

#[async_trait]
impl ReplaySession for PgSession {
    async fn simple(&mut self, sql: &str) -> std::result::Result<(), ReplayError> {
        self.client()?.batch_execute(sql).await?;
        Ok(())
    }

    async fn prepared(&mut self, stmt: &ReplayableStatement) -> std::result::Result<(), ReplayError> {
        let statement = match self.statements.get(&stmt.sql) {
            Some(s) => s.clone(),
            None => {
                let s = self.prepare(stmt).await?;
                self.statements.insert(stmt.sql.clone(), s.clone());
                s
            }
        };
        let params = convert_params(&stmt.params, statement.params())?;
        let refs: Vec<_> = params.iter().map(|p| p.as_tosql()).collect();
        self.client()?.execute(&statement, &refs).await?;
        Ok(())
    }

    async fn close(&mut self) -> std::result::Result<(), ReplayError> {
        self.statements.clear();
        drop(self.client.take());
        if let Some(handle) = self.connection.take() {
            handle
                .await
                .map_err(|e| ReplayError::Connection(format!("connection task failed: {}", e)))?;
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Clients and results
// -----------------------------------------------------------------------------

/// One captured connection's statements
#[derive(Debug, Clone)]
pub struct ReplayClient {
    pub id: u64,
    pub statements: Vec<ReplayableStatement>,
}

/// Load every `*.interactions` file of `dir`, ordered by connection id
pub fn load_clients(dir: &Path) -> Result<Vec<ReplayClient>> {
    let mut clients = Vec::new();
    let listing = std::fs::read_dir(dir).with_context(|| format!("Failed to read directory {}", dir.display()))?;
    for entry in listing {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(INTERACTIONS_EXTENSION) {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| ReplayError::InteractionFormat {
                path: path.display().to_string(),
                reason: "file name is not a connection id".to_string(),
            })?;
        let statements = read_interactions(&path)?;
        debug!("Loaded client {} with {} statements", id, statements.len());
        clients.push(ReplayClient { id, statements });
    }
    clients.sort_by_key(|c| c.id);
    Ok(clients)
}

/// Outcome and timings of one client
#[derive(Debug, Clone)]
pub struct ClientResult {
    pub client_id: u64,
    pub success: bool,
    pub statements_executed: usize,
    pub statements_total: usize,
    pub connect_started: Option<Instant>,
    pub connected: Option<Instant>,
    pub run_started: Option<Instant>,
    pub run_finished: Option<Instant>,
    pub done: Option<Instant>,
    pub latencies: LatencyHist,
    pub error: Option<String>,
}

impl ClientResult {
    fn new(client_id: u64, statements_total: usize) -> Self {
        Self {
            client_id,
            success: false,
            statements_executed: 0,
            statements_total,
            connect_started: None,
            connected: None,
            run_started: None,
            run_finished: None,
            done: None,
            latencies: LatencyHist::new(),
            error: None,
        }
    }

    fn failed(client_id: u64, statements_total: usize, error: impl Into<String>) -> Self {
        let mut result = Self::new(client_id, statements_total);
        result.error = Some(error.into());
        result
    }

    /// Time spent executing statements
    pub fn run_duration(&self) -> Duration {
        span(self.run_started, self.run_finished)
    }

    /// Time from before connect to after close
    pub fn connection_duration(&self) -> Duration {
        span(self.connect_started, self.done)
    }
}

fn span(from: Option<Instant>, to: Option<Instant>) -> Duration {
    match (from, to) {
        (Some(a), Some(b)) => b.saturating_duration_since(a),
        _ => Duration::ZERO,
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Bound on the wait for every worker to reach the gate
    pub ready_timeout: Duration,
    /// Bound on the wait for every worker to finish, counted from gate release
    pub timeout: Duration,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            ready_timeout: DEFAULT_READY_TIMEOUT,
            timeout: DEFAULT_REPLAY_TIMEOUT,
        }
    }
}

/// Result of one replay run
#[derive(Debug)]
pub struct ReplayReport {
    pub started_at: chrono::DateTime<chrono::Local>,
    pub released_at: Option<Instant>,
    /// Ready signals observed when the gate was released
    pub ready_at_release: usize,
    /// last done - gate release
    pub wall: Duration,
    pub timed_out: bool,
    pub clients: Vec<ClientResult>,
}

impl ReplayReport {
    pub fn failed_clients(&self) -> usize {
        self.clients.iter().filter(|c| !c.success).count()
    }

    pub fn statements_executed(&self) -> usize {
        self.clients.iter().map(|c| c.statements_executed).sum()
    }

    pub fn merged_latencies(&self) -> LatencyHist {
        let mut merged = LatencyHist::new();
        for c in &self.clients {
            merged.merge(&c.latencies);
        }
        merged
    }
}

// -----------------------------------------------------------------------------
// Coordinator
// -----------------------------------------------------------------------------

/// Replay all clients concurrently, one worker each
pub async fn run_replay(
    clients: Vec<ReplayClient>,
    backend: Arc<dyn ReplayBackend>,
    options: &ReplayOptions,
) -> ReplayReport {
    let started_at = chrono::Local::now();
    let gate = Arc::new(StartGate::new(clients.len()));
    info!("Starting replay of {} clients", clients.len());

    let mut workers = Vec::with_capacity(clients.len());
    for client in clients {
        let id = client.id;
        let total = client.statements.len();
        let handle = tokio::spawn(run_client(client, Arc::clone(&backend), Arc::clone(&gate)));
        workers.push((id, total, handle));
    }

    let mut timed_out = false;
    if tokio::time::timeout(options.ready_timeout, gate.wait_all_ready())
        .await
        .is_err()
    {
        warn!(
            "Only {}/{} clients ready after {:?}; releasing anyway",
            gate.ready_count(),
            workers.len(),
            options.ready_timeout
        );
        timed_out = true;
    }

    let ready_at_release = gate.ready_count();
    let released = gate.release();
    info!("Start gate released with {} clients ready", ready_at_release);

    let deadline = tokio::time::Instant::from_std(released + options.timeout);
    let mut results = Vec::with_capacity(workers.len());
    for (id, total, mut handle) in workers {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(result)) => results.push(result),
            Ok(Err(e)) => {
                error!("Client {} worker failed: {}", id, e);
                results.push(ClientResult::failed(id, total, format!("worker failed: {}", e)));
            }
            Err(_) => {
                handle.abort();
                warn!("Client {} did not finish within {:?}", id, options.timeout);
                timed_out = true;
                results.push(ClientResult::failed(id, total, "timed out"));
            }
        }
    }

    let wall = results
        .iter()
        .filter_map(|r| r.done)
        .max()
        .map(|last| last.saturating_duration_since(released))
        .unwrap_or_default();

    if timed_out {
        let pending = results.iter().filter(|r| r.done.is_none()).count();
        warn!(
            "{}",
            ReplayError::Timeout {
                elapsed: released.elapsed(),
                pending
            }
        );
    }

    ReplayReport {
        started_at,
        released_at: Some(released),
        ready_at_release,
        wall,
        timed_out,
        clients: results,
    }
}

async fn run_client(client: ReplayClient, backend: Arc<dyn ReplayBackend>, gate: Arc<StartGate>) -> ClientResult {
    let mut result = ClientResult::new(client.id, client.statements.len());

    result.connect_started = Some(Instant::now());
    let session = backend.connect(client.id).await;
    result.connected = Some(Instant::now());

    // A client that failed to connect still arrives so peers are not held back
    gate.arrive();
    gate.wait_release().await;

    let mut session = match session {
        Ok(s) => s,
        Err(e) => {
            warn!("Client {}: {}", client.id, e);
            result.error = Some(e.to_string());
            result.done = Some(Instant::now());
            return result;
        }
    };

    result.run_started = Some(Instant::now());
    let outcome = replay_statements(session.as_mut(), &client.statements, &mut result).await;
    result.run_finished = Some(Instant::now());

    match outcome {
        Ok(()) => result.success = true,
        Err(e) => {
            warn!(
                "Client {} stopped at statement {}/{}: {}",
                client.id,
                result.statements_executed + 1,
                result.statements_total,
                e
            );
            result.error = Some(e.to_string());
        }
    }

    if let Err(e) = session.close().await {
        debug!("Client {}: close failed: {}", client.id, e);
    }
    result.done = Some(Instant::now());
    result
}

async fn replay_statements(
    session: &mut dyn ReplaySession,
    statements: &[ReplayableStatement],
    result: &mut ClientResult,
) -> std::result::Result<(), ReplayError> {
    let mut autocommit = true;
    for stmt in statements {
        let t0 = Instant::now();
        match stmt.tx_control() {
            Some(TxControl::Begin) => {
                session.simple(&stmt.sql).await?;
                autocommit = false;
            }
            Some(TxControl::Commit) | Some(TxControl::Rollback) => {
                session.simple(&stmt.sql).await?;
                autocommit = true;
            }
            None if stmt.prepared => session.prepared(stmt).await?,
            None => session.simple(&stmt.sql).await?,
        }
        result.latencies.record(t0.elapsed());
        result.statements_executed += 1;
    }
    if !autocommit {
        debug!("Client {} ended inside an open transaction", result.client_id);
    }
    Ok(())
}
