//! # Listener machinery — bind, admit, session lifecycle
//!
//! Shared plumbing for every protocol server: the TCP accept loop with
//! gate admission (a denied peer's socket is closed before any session
//! task exists), the per-listener session cap, idle timeouts, and the
//! drain-then-abort stop sequence.

use crate::mirror::MapMirror;
use async_trait::async_trait;
use gridforge_core::{CoreError, CoreResult};
use gridforge_network::{Admission, ConnectionLog, NetworkGate};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Default per-session idle timeout (Modbus convention: 30 s).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default cap on concurrent sessions per listener.
pub const DEFAULT_SESSION_CAP: usize = 32;

/// The contract every protocol listener fulfils for the orchestrator.
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    fn device_name(&self) -> &str;
    fn protocol(&self) -> &'static str;
    /// Actual bound port once started (differs from the configured port
    /// when binding port 0 for an ephemeral assignment).
    fn local_addr(&self) -> Option<SocketAddr>;
    /// The mirror the orchestrator syncs against.
    fn mirror(&self) -> &Arc<MapMirror>;
    /// Bind and begin accepting. Returns once listening.
    async fn start(&self) -> CoreResult<()>;
    /// Refuse new connections, drain sessions briefly, abort stragglers.
    async fn stop(&self);
}

/// Context handed to a session task.
pub(crate) struct SessionCtx {
    pub device: String,
    pub mirror: Arc<MapMirror>,
    pub session_id: u64,
    pub connections: Arc<ConnectionLog>,
    pub idle_timeout: Duration,
}

pub(crate) type SessionFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) trait SessionHandler: Send + Sync + 'static {
    fn run(&self, stream: TcpStream, ctx: SessionCtx) -> SessionFuture;
}

/// State common to every listener implementation.
pub(crate) struct ListenerCore {
    pub device: String,
    pub protocol: &'static str,
    pub host: String,
    pub port: u16,
    pub gate: Arc<NetworkGate>,
    pub mirror: Arc<MapMirror>,
    pub idle_timeout: Duration,
    pub session_cap: usize,
    pub drain_window: Duration,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    session_tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    active_sessions: Arc<AtomicUsize>,
}

impl ListenerCore {
    pub fn new(
        device: &str,
        protocol: &'static str,
        host: &str,
        port: u16,
        gate: Arc<NetworkGate>,
        mirror: Arc<MapMirror>,
    ) -> Self {
        Self {
            device: device.to_string(),
            protocol,
            host: host.to_string(),
            port,
            gate,
            mirror,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            session_cap: DEFAULT_SESSION_CAP,
            drain_window: Duration::from_millis(500),
            running: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            session_tasks: Arc::new(Mutex::new(Vec::new())),
            active_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub async fn start(&self, handler: Arc<dyn SessionHandler>) -> CoreResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(device = %self.device, protocol = self.protocol, "Listener already running");
            return Ok(());
        }
        let bind_addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            CoreError::BindFailed {
                addr: bind_addr.clone(),
                source: e,
            }
        })?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!(
            device = %self.device,
            protocol = self.protocol,
            addr = %local,
            "Listener started"
        );

        let device = self.device.clone();
        let protocol = self.protocol;
        let gate = Arc::clone(&self.gate);
        let mirror = Arc::clone(&self.mirror);
        let running = Arc::clone(&self.running);
        let session_tasks = Arc::clone(&self.session_tasks);
        let active = Arc::clone(&self.active_sessions);
        let session_cap = self.session_cap;
        let idle_timeout = self.idle_timeout;
        let service_port = local.port();

        let accept = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        if running.load(Ordering::Relaxed) {
                            warn!(device = %device, error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                        break;
                    }
                };
                if !running.load(Ordering::Relaxed) {
                    break;
                }

                // Admission before any session exists. Deny → the socket
                // drops right here.
                let admission = gate.admit(peer, &device, protocol, service_port);
                let session_id = match admission {
                    Admission::Denied { .. } => continue,
                    Admission::Allowed { session_id, .. } => session_id,
                };

                if active.load(Ordering::Relaxed) >= session_cap {
                    warn!(
                        device = %device,
                        peer = %peer,
                        cap = session_cap,
                        "Session cap reached, refusing connection"
                    );
                    gate.connections().close(session_id);
                    continue;
                }

                active.fetch_add(1, Ordering::Relaxed);
                let ctx = SessionCtx {
                    device: device.clone(),
                    mirror: Arc::clone(&mirror),
                    session_id,
                    connections: Arc::clone(gate.connections()),
                    idle_timeout,
                };
                let connections = Arc::clone(gate.connections());
                let active_for_task = Arc::clone(&active);
                let fut = handler.run(stream, ctx);
                let task = tokio::spawn(async move {
                    fut.await;
                    connections.close(session_id);
                    active_for_task.fetch_sub(1, Ordering::Relaxed);
                });

                let mut tasks = session_tasks.lock();
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
            }
            debug!(device = %device, protocol, "Accept loop exited");
        });
        *self.accept_task.lock() = Some(accept);
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }

        // Give live sessions a short drain window, then abort.
        let deadline = tokio::time::Instant::now() + self.drain_window;
        while self.active_sessions.load(Ordering::Relaxed) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining: Vec<_> = self.session_tasks.lock().drain(..).collect();
        for task in remaining {
            task.abort();
        }
        info!(device = %self.device, protocol = self.protocol, "Listener stopped");
    }
}

// ── Request/response session listeners ──────────────────────────────────────

/// What to do with one inbound buffer on a request/response protocol.
pub enum ExchangeAction {
    Reply(Vec<u8>),
    Close,
    Ignore,
}

/// A simple request→response protocol personality. Used by the secondary
/// protocol surfaces; Modbus has a dedicated framed session loop.
pub trait WireExchange: Send + Sync + 'static {
    fn protocol(&self) -> &'static str;
    fn respond(&self, request: &[u8]) -> ExchangeAction;
}

struct ExchangeHandler {
    exchange: Arc<dyn WireExchange>,
}

impl SessionHandler for ExchangeHandler {
    fn run(&self, mut stream: TcpStream, ctx: SessionCtx) -> SessionFuture {
        let exchange = Arc::clone(&self.exchange);
        Box::pin(async move {
            let mut buf = [0u8; 1024];
            loop {
                let read = tokio::time::timeout(ctx.idle_timeout, stream.read(&mut buf)).await;
                let n = match read {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Ok(n)) => n,
                    Ok(Err(_)) => break,
                };
                match exchange.respond(&buf[..n]) {
                    ExchangeAction::Reply(reply) => {
                        ctx.connections.record_request(ctx.session_id);
                        if stream.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                    ExchangeAction::Close => break,
                    ExchangeAction::Ignore => continue,
                }
            }
        })
    }
}

/// Generic listener for the secondary protocols: gate admission, session
/// accounting, and a `WireExchange` personality.
pub struct SessionListener {
    core: ListenerCore,
    exchange: Arc<dyn WireExchange>,
}

impl SessionListener {
    pub fn new(
        device: &str,
        host: &str,
        port: u16,
        gate: Arc<NetworkGate>,
        mirror: Arc<MapMirror>,
        exchange: Arc<dyn WireExchange>,
    ) -> Self {
        let core = ListenerCore::new(device, exchange.protocol(), host, port, gate, mirror);
        Self { core, exchange }
    }

    pub fn active_sessions(&self) -> usize {
        self.core.active_sessions()
    }
}

#[async_trait]
impl ProtocolServer for SessionListener {
    fn device_name(&self) -> &str {
        &self.core.device
    }

    fn protocol(&self) -> &'static str {
        self.core.protocol
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr()
    }

    fn mirror(&self) -> &Arc<MapMirror> {
        &self.core.mirror
    }

    async fn start(&self) -> CoreResult<()> {
        self.core
            .start(Arc::new(ExchangeHandler {
                exchange: Arc::clone(&self.exchange),
            }))
            .await
    }

    async fn stop(&self) {
        self.core.stop().await;
    }
}
