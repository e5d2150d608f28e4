//! One viewer connection, from handshake to teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::changeset::ChangeSet;
use crate::codec::ServerCodec;
use crate::dispatch::DispatchPipeline;
use crate::error::TesseraError;
use crate::event::{ClientEvent, CoalesceKey, ServerEvent};
use crate::input::InputSink;
use crate::manager::{AccessMode, ClientId, DisplayManager};
use crate::monitor::{ScreenListener, ScreenMonitor};
use crate::payload::SharedPayload;

/// Cleanup registered against a session, run once by [`ClientSession::kill`].
pub type TeardownAction = Box<dyn FnOnce() -> Result<(), TesseraError> + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Server side of a viewer connection.
///
/// Created per accepted socket. [`run`](Self::run) reads viewer events
/// until the peer goes away or something fatal happens, then tears the
/// session down.
pub struct ClientSession<W> {
    id: ClientId,
    manager: Arc<DisplayManager>,
    input: Arc<dyn InputSink>,
    pipeline: DispatchPipeline<W>,
    monitor: Mutex<Option<Arc<ScreenMonitor>>>,
    gate: Mutex<Gate>,
    teardown: Mutex<Vec<TeardownAction>>,
    shutdown: CancellationToken,
    dying: AtomicBool,
    alive: AtomicBool,
}

/// Screen notifications are forwarded only once the viewer has been told
/// about the display it bound to. A change set that arrives earlier is
/// dropped and remembered so a full render can be forced afterwards.
#[derive(Default)]
struct Gate {
    open: bool,
    missed: bool,
}

/// Monitor-facing half of a session. Holds it weakly so a forgotten
/// binding cannot keep a dead connection alive.
struct Viewer<W> {
    session: Weak<ClientSession<W>>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> ScreenListener for Viewer<W> {
    fn on_screen_change(&self, changes: &ChangeSet) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let mut gate = lock(&session.gate);
        if !gate.open {
            gate.missed = true;
            return;
        }
        for segment in changes.iter_ones() {
            session.pipeline.send_event(ServerEvent::SegmentChanged {
                segment: segment as i32,
            });
        }
    }

    fn on_display_event(&self, payload: &SharedPayload) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let mut gate = lock(&session.gate);
        if gate.open {
            session.pipeline.send_payload(Arc::clone(payload));
        } else {
            gate.missed = true;
        }
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> ClientSession<W> {
    /// Must be called inside a Tokio runtime.
    pub fn new(
        id: ClientId,
        writer: W,
        manager: Arc<DisplayManager>,
        input: Arc<dyn InputSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            manager,
            input,
            pipeline: DispatchPipeline::new(writer),
            monitor: Mutex::new(None),
            gate: Mutex::new(Gate::default()),
            teardown: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            dying: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Read and handle viewer events until the connection ends, then tear down.
    ///
    /// Returns the teardown result.
    pub async fn run<R: AsyncRead + Unpin>(self: &Arc<Self>, reader: R) -> Result<(), TesseraError> {
        let mut frames = FramedRead::new(reader, ServerCodec::new());
        let fatal = self.pipeline.fatal();
        info!(client = self.id, "session started");
        self.send_event(ServerEvent::ConnectionEstablished);

        loop {
            let frame = tokio::select! {
                _ = fatal.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(ClientEvent::Goodbye)) => {
                    debug!(client = self.id, "viewer said goodbye");
                    break;
                }
                Some(Ok(event)) => {
                    if let Err(e) = self.handle(event) {
                        warn!(client = self.id, "{e}");
                    }
                }
                Some(Err(e)) => {
                    warn!(client = self.id, "dropping connection: {e}");
                    break;
                }
                None => {
                    debug!(client = self.id, "{}", TesseraError::ConnectionReset);
                    break;
                }
            }
        }

        let result = self.kill();
        self.join().await;
        result
    }

    pub fn send_event(&self, event: ServerEvent) {
        self.pipeline.send_event(event);
    }

    fn handle(self: &Arc<Self>, event: ClientEvent) -> Result<(), TesseraError> {
        trace!(client = self.id, ?event, "received");
        match event {
            ClientEvent::SelectScreen {
                screen,
                mode,
                password,
            } => {
                self.select_screen(screen, mode, password.as_deref());
                Ok(())
            }
            ClientEvent::GetSegment { segment } => {
                let payload = self.bound_monitor()?.segment_payload(segment)?;
                self.pipeline.send_payload(payload);
                Ok(())
            }
            ClientEvent::EventAck { kind, segment } => {
                self.pipeline
                    .handle_event_ack(CoalesceKey::for_ack(kind, segment));
                Ok(())
            }
            ClientEvent::RefreshRate { period_ms } => {
                self.bound_monitor()?;
                self.manager
                    .set_refresh_rate(self.id, period_ms.map(Duration::from_millis));
                Ok(())
            }
            ClientEvent::Mouse(mut mouse) => {
                let monitor = self.controlling_monitor()?;
                let (x, y) = monitor.origin();
                mouse.x = mouse.x.saturating_add(x);
                mouse.y = mouse.y.saturating_add(y);
                self.input.inject_mouse(&mouse)
            }
            ClientEvent::Key(key) => {
                self.controlling_monitor()?;
                self.input.inject_key(&key)
            }
            ClientEvent::Goodbye => Ok(()),
        }
    }

    fn select_screen(self: &Arc<Self>, screen: u32, mode: AccessMode, password: Option<&str>) {
        *lock(&self.gate) = Gate::default();
        let viewer = Arc::new(Viewer {
            session: Arc::downgrade(self),
        });

        let monitor = match self.manager.bind(self.id, viewer, screen, mode, password) {
            Ok(Some(monitor)) => monitor,
            Ok(None) => return self.refuse(TesseraError::Unauthorized),
            Err(e) => return self.refuse(e),
        };

        self.send_event(ServerEvent::AuthorizationUpdate { granted: true });
        for event in monitor.display_init_events() {
            self.send_event(event);
        }
        self.send_event(ServerEvent::ReadInputEvents {
            enabled: mode.allows_input(),
        });
        self.open_gate(&monitor);
        lock(&self.monitor).replace(monitor);
        info!(client = self.id, screen, %mode, "viewer authorized");
    }

    /// Start forwarding monitor notifications. Anything dropped while the
    /// gate was closed is made good: the display state is re-announced and
    /// the next cycle renders every tile.
    fn open_gate(&self, monitor: &ScreenMonitor) {
        let missed = {
            let mut gate = lock(&self.gate);
            gate.open = true;
            std::mem::take(&mut gate.missed)
        };
        if missed {
            debug!(client = self.id, "display changed during bind, resyncing");
            for event in monitor.display_init_events() {
                self.send_event(event);
            }
            self.manager.set_is_new(self.id, true);
        }
    }

    /// Tell the viewer it was refused. The pipeline closes the connection
    /// once the refusal is on the wire.
    fn refuse(&self, reason: TesseraError) {
        warn!(client = self.id, "authorization failed: {reason}");
        lock(&self.monitor).take();
        self.send_event(ServerEvent::FailedAuthorization);
        self.send_event(ServerEvent::AuthorizationUpdate { granted: false });
    }

    fn bound_monitor(&self) -> Result<Arc<ScreenMonitor>, TesseraError> {
        lock(&self.monitor).clone().ok_or(TesseraError::Unauthorized)
    }

    fn controlling_monitor(&self) -> Result<Arc<ScreenMonitor>, TesseraError> {
        let monitor = self.bound_monitor()?;
        match self.manager.mode(self.id) {
            Some(mode) if mode.allows_input() => Ok(monitor),
            _ => Err(TesseraError::Unauthorized),
        }
    }

    /// Register cleanup to run on teardown. If the session is already
    /// dying the action runs immediately.
    pub fn add_on_destroy_action(&self, action: TeardownAction) -> Result<(), TesseraError> {
        let mut actions = lock(&self.teardown);
        if self.dying.load(Ordering::SeqCst) {
            drop(actions);
            return action();
        }
        actions.push(action);
        Ok(())
    }

    /// Tear the session down. Idempotent.
    ///
    /// Every teardown action runs even if an earlier one fails; the first
    /// failure is returned, later ones are logged.
    pub fn kill(&self) -> Result<(), TesseraError> {
        let actions = {
            let mut actions = lock(&self.teardown);
            if self.dying.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            std::mem::take(&mut *actions)
        };
        self.shutdown.cancel();
        lock(&self.gate).open = false;
        self.manager.unbind(self.id);
        lock(&self.monitor).take();

        let mut first_error = None;
        for action in actions {
            if let Err(e) = action() {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    error!(client = self.id, "teardown action failed: {e}");
                }
            }
        }

        self.pipeline.dispose();
        self.alive.store(false, Ordering::SeqCst);
        info!(client = self.id, "session closed");

        match first_error {
            Some(e) => Err(TesseraError::Teardown(e.to_string())),
            None => Ok(()),
        }
    }

    /// Wait for the outbound workers to exit. Call after [`kill`](Self::kill).
    pub async fn join(&self) {
        self.pipeline.join().await;
    }

    pub fn is_running(&self) -> bool {
        !self.dying.load(Ordering::SeqCst)
    }

    pub fn is_dead(&self) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> Option<AccessMode> {
        self.manager.mode(self.id)
    }

    pub fn is_new(&self) -> Option<bool> {
        self.manager.is_new(self.id)
    }

    pub fn set_is_new(&self, is_new: bool) -> bool {
        self.manager.set_is_new(self.id, is_new)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::SinkExt;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio_util::codec::FramedWrite;

    use super::*;
    use crate::capture::{DisplayCapture, MemoryDisplay};
    use crate::codec::{Outbound, ViewerCodec};
    use crate::geometry::Rect;
    use crate::input::{KeyEvent, MouseEvent};
    use crate::monitor::MonitorConfig;
    use crate::payload::CompressedPayload;

    #[derive(Default)]
    struct RecordingSink {
        mice: Mutex<Vec<MouseEvent>>,
        keys: AtomicUsize,
    }

    impl InputSink for RecordingSink {
        fn inject_mouse(&self, event: &MouseEvent) -> Result<(), TesseraError> {
            self.mice.lock().unwrap().push(*event);
            Ok(())
        }

        fn inject_key(&self, _: &KeyEvent) -> Result<(), TesseraError> {
            self.keys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    type Session = Arc<ClientSession<WriteHalf<DuplexStream>>>;

    struct Harness {
        session: Session,
        input: Arc<RecordingSink>,
        manager: Arc<DisplayManager>,
        reader: Option<ReadHalf<DuplexStream>>,
        viewer: DuplexStream,
    }

    fn harness(password: Option<&str>) -> Harness {
        let mut manager = DisplayManager::new(MonitorConfig {
            segment_width: 8,
            segment_height: 8,
            ..MonitorConfig::default()
        });
        manager.add_display(Box::new(|| {
            let (display, _) = MemoryDisplay::new("mem", Rect::new(100, 50, 16, 16), 0);
            Ok(Box::new(display) as Box<dyn DisplayCapture>)
        }));
        if let Some(password) = password {
            manager = manager.with_password(password);
        }
        let manager = Arc::new(manager);
        let input = Arc::new(RecordingSink::default());

        let (server, viewer) = tokio::io::duplex(1 << 20);
        let (reader, writer) = tokio::io::split(server);
        let session = ClientSession::new(7, writer, Arc::clone(&manager), input.clone());
        Harness {
            session,
            input,
            manager,
            reader: Some(reader),
            viewer,
        }
    }

    #[tokio::test]
    async fn teardown_runs_every_action_and_reports_first_error() {
        let h = harness(None);
        let ran = Arc::new(AtomicUsize::new(0));

        for outcome in [Ok(()), Err("first"), Ok(()), Err("second")] {
            let ran = Arc::clone(&ran);
            h.session
                .add_on_destroy_action(Box::new(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                    outcome.map_err(|msg| TesseraError::Input(msg.into()))
                }))
                .unwrap();
        }

        let err = h.session.kill().unwrap_err();
        assert!(matches!(err, TesseraError::Teardown(ref msg) if msg.contains("first")));
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert!(h.session.is_dead());
        assert!(!h.session.is_running());

        assert!(h.session.kill().is_ok());
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn action_added_after_death_runs_immediately() {
        let h = harness(None);
        h.session.kill().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        h.session
            .add_on_destroy_action(Box::new(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn view_only_input_is_dropped_full_control_is_offset() {
        let mut h = harness(None);
        let session = Arc::clone(&h.session);
        let reader = h.reader.take().unwrap();
        let run = tokio::spawn(async move { session.run(reader).await });

        let (rx, tx) = tokio::io::split(h.viewer);
        let mut out = FramedWrite::new(tx, ViewerCodec::new());
        let mut events = FramedRead::new(rx, ViewerCodec::new());

        for (mode, x) in [(AccessMode::ViewOnly, 1), (AccessMode::FullControl, 2)] {
            out.send(Outbound::Message(ClientEvent::SelectScreen {
                screen: 0,
                mode,
                password: None,
            }))
            .await
            .unwrap();
            out.send(Outbound::Message(ClientEvent::Mouse(MouseEvent::move_to(x, 3))))
                .await
                .unwrap();
            out.send(Outbound::Message(ClientEvent::Key(KeyEvent::press(65, 0))))
                .await
                .unwrap();
        }
        out.send(Outbound::Message(ClientEvent::Goodbye)).await.unwrap();

        // Drain until the server closes its side.
        while let Some(frame) = events.next().await {
            frame.unwrap();
        }
        run.await.unwrap().unwrap();

        let mice = h.input.mice.lock().unwrap().clone();
        assert_eq!(mice.len(), 1);
        assert_eq!((mice[0].x, mice[0].y), (102, 53));
        assert_eq!(h.input.keys.load(Ordering::SeqCst), 1);
        assert_eq!(h.manager.monitor_count(), 0);
    }

    #[tokio::test]
    async fn extreme_pointer_coordinates_saturate() {
        let mut h = harness(None);
        let session = Arc::clone(&h.session);
        let reader = h.reader.take().unwrap();
        let run = tokio::spawn(async move { session.run(reader).await });

        let (rx, tx) = tokio::io::split(h.viewer);
        let mut out = FramedWrite::new(tx, ViewerCodec::new());
        let mut events = FramedRead::new(rx, ViewerCodec::new());
        out.send(Outbound::Message(ClientEvent::SelectScreen {
            screen: 0,
            mode: AccessMode::FullControl,
            password: None,
        }))
        .await
        .unwrap();
        out.send(Outbound::Message(ClientEvent::Mouse(MouseEvent::move_to(
            i32::MAX,
            i32::MIN,
        ))))
        .await
        .unwrap();
        out.send(Outbound::Message(ClientEvent::Goodbye)).await.unwrap();

        while let Some(frame) = events.next().await {
            frame.unwrap();
        }
        run.await.unwrap().unwrap();

        let mice = h.input.mice.lock().unwrap().clone();
        assert_eq!(mice.len(), 1);
        assert_eq!((mice[0].x, mice[0].y), (i32::MAX, i32::MIN + 50));
        assert_eq!(h.manager.monitor_count(), 0);
    }

    #[tokio::test]
    async fn display_event_missed_during_bind_is_reannounced() {
        let h = harness(None);
        let mut events = FramedRead::new(h.viewer, ViewerCodec::new());

        h.session.select_screen(0, AccessMode::ViewOnly, None);
        let monitor = h.session.bound_monitor().unwrap();

        // A resize lands after the init events went out but before the
        // gate opened.
        lock(&h.session.gate).open = false;
        let viewer = Viewer {
            session: Arc::downgrade(&h.session),
        };
        viewer.on_display_event(&CompressedPayload::new(ServerEvent::ScreenResized {
            width: 1,
            height: 1,
        }));
        assert!(lock(&h.session.gate).missed);
        h.session.open_gate(&monitor);

        let mut resizes = Vec::new();
        while resizes.len() < 2 {
            let frame = tokio::time::timeout(Duration::from_secs(5), events.next())
                .await
                .expect("timeout")
                .expect("closed")
                .unwrap();
            if let ServerEvent::ScreenResized { width, height } = frame {
                resizes.push((width, height));
            }
        }
        assert_eq!(resizes, vec![(16, 16), (16, 16)]);
        assert!(!lock(&h.session.gate).missed);
        h.session.kill().unwrap();
    }

    #[tokio::test]
    async fn wrong_password_is_refused_and_closed() {
        let mut h = harness(Some("secret"));
        let session = Arc::clone(&h.session);
        let reader = h.reader.take().unwrap();
        let run = tokio::spawn(async move { session.run(reader).await });

        let (rx, tx) = tokio::io::split(h.viewer);
        let mut out = FramedWrite::new(tx, ViewerCodec::new());
        let mut events = FramedRead::new(rx, ViewerCodec::new());
        out.send(Outbound::Message(ClientEvent::SelectScreen {
            screen: 0,
            mode: AccessMode::ViewOnly,
            password: Some("guess".into()),
        }))
        .await
        .unwrap();

        let mut received = Vec::new();
        while let Some(frame) = events.next().await {
            received.push(frame.unwrap());
        }
        assert_eq!(
            received,
            vec![
                ServerEvent::ConnectionEstablished,
                ServerEvent::FailedAuthorization,
                ServerEvent::AuthorizationUpdate { granted: false },
            ]
        );
        run.await.unwrap().unwrap();
        assert!(h.session.is_dead());
        assert_eq!(h.manager.monitor_count(), 0);
    }

    #[tokio::test]
    async fn garbage_input_resets_connection() {
        use tokio::io::AsyncWriteExt;

        let mut h = harness(None);
        let session = Arc::clone(&h.session);
        let reader = h.reader.take().unwrap();
        let run = tokio::spawn(async move { session.run(reader).await });

        h.viewer
            .write_all(&[0, 0, 0, 4, 0xDE, 0xAD, 0xBE, 0xEF])
            .await
            .unwrap();
        run.await.unwrap().unwrap();
        assert!(h.session.is_dead());
    }
}
