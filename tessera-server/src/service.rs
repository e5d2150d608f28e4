//! Server lifecycle: displays, the viewer listener and sessions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use tessera_core::{ClientSession, DisplayManager, InputSink, LogInputSink};

use crate::config::ServerConfig;
use crate::displays::TestPattern;

type Session = ClientSession<OwnedWriteHalf>;

// ── TesseraService ───────────────────────────────────────────────

/// The top-level screen-sharing service.
///
/// Owns the display manager and a TCP listener accepting viewers, one
/// [`ClientSession`] per connection.
pub struct TesseraService {
    config: ServerConfig,
    running: Arc<AtomicBool>,
}

impl TesseraService {
    /// Create a new service with the given config.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Bind the configured address and serve until stopped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.network.bind_address, self.config.network.port
        )
        .parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve viewers on an already-bound listener until stopped.
    ///
    /// 1. Builds the configured displays and starts their animations.
    /// 2. Accepts viewers, spawning a session for each.
    /// 3. On stop, kills every live session and waits for them to exit.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        self.running.store(true, Ordering::SeqCst);
        let manager = Arc::new(self.build_manager());
        let input: Arc<dyn InputSink> = Arc::new(LogInputSink);
        info!(
            "listening on {} ({} display(s))",
            listener.local_addr()?,
            manager.screen_count()
        );

        let mut sessions: Vec<(Arc<Session>, JoinHandle<()>)> = Vec::new();
        let mut next_id = 0;

        while self.running.load(Ordering::SeqCst) {
            let accept = tokio::select! {
                result = listener.accept() => result,
                _ = Self::wait_for_stop(&self.running) => break,
            };
            let (stream, peer) = match accept {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            let (finished, live): (Vec<_>, Vec<_>) = std::mem::take(&mut sessions)
                .into_iter()
                .partition(|(_, task)| task.is_finished());
            sessions = live;
            for (session, task) in finished {
                Self::reap(session, task).await;
            }
            let limit = self.config.network.max_connections as usize;
            if limit > 0 && sessions.len() >= limit {
                warn!("refusing {peer}: {limit} viewer(s) already connected");
                continue;
            }

            next_id += 1;
            info!(client = next_id, "viewer connected from {peer}");
            let (reader, writer) = stream.into_split();
            let session = ClientSession::new(next_id, writer, Arc::clone(&manager), Arc::clone(&input));
            let task = tokio::spawn({
                let session = Arc::clone(&session);
                async move {
                    if let Err(e) = session.run(reader).await {
                        error!("session with {peer} ended badly: {e}");
                    }
                }
            });
            sessions.push((session, task));
        }

        for (session, task) in sessions {
            if let Err(e) = session.kill() {
                error!("teardown of client {} failed: {e}", session.id());
            }
            Self::reap(session, task).await;
        }

        self.running.store(false, Ordering::SeqCst);
        info!("service stopped");
        Ok(())
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Collect a session task. A task that died without tearing its
    /// session down (a panic) gets torn down here.
    async fn reap<W>(session: Arc<ClientSession<W>>, task: JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Err(e) = task.await else {
            return;
        };
        error!(client = session.id(), "session task failed: {e}");
        if e.is_panic() {
            if let Err(e) = session.kill() {
                error!(client = session.id(), "teardown failed: {e}");
            }
            session.join().await;
        }
    }

    fn build_manager(&self) -> DisplayManager {
        let mut manager = DisplayManager::new(self.config.to_monitor_config())
            .with_default_refresh(self.config.default_refresh());
        if let Some(password) = self.config.password() {
            manager = manager.with_password(password);
        }

        for disp in self.config.displays() {
            let (pattern, factory) = TestPattern::new(&disp);
            let screen = manager.add_display(factory);
            info!(screen, "display {:?} {}x{}", disp.name, disp.width, disp.height);
            if disp.animate_ms > 0 {
                let period = Duration::from_millis(disp.animate_ms);
                tokio::spawn(pattern.animate(period, Arc::clone(&self.running)));
            }
        }
        manager
    }

    /// Async helper: resolves when `running` becomes false.
    async fn wait_for_stop(running: &Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
