//! Display registry and viewer bindings.
//!
//! [`DisplayManager`] knows which displays exist (as factories), starts a
//! [`ScreenMonitor`] when a display gets its first viewer and retires it
//! when the last one leaves. It also records each viewer's access mode
//! and refresh request so both can be undone on unbind.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capture::DisplayCapture;
use crate::error::TesseraError;
use crate::event::SegmentData;
use crate::geometry::SegmentId;
use crate::monitor::{BindingId, MonitorConfig, ScreenListener, ScreenMonitor};

// ── AccessMode ───────────────────────────────────────────────────

/// What a viewer may do once bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ViewOnly,
    ViewAndChat,
    FullControl,
    All,
}

impl AccessMode {
    const VALUES: [AccessMode; 4] = [
        AccessMode::ViewOnly,
        AccessMode::ViewAndChat,
        AccessMode::FullControl,
        AccessMode::All,
    ];

    /// Name used in configuration and on the wire in textual form.
    pub const fn common_name(self) -> &'static str {
        match self {
            AccessMode::ViewOnly => "VIEW_ONLY",
            AccessMode::ViewAndChat => "VIEW_AND_CHAT",
            AccessMode::FullControl => "FULL_CONTROL",
            AccessMode::All => "*",
        }
    }

    /// Every mode, ordered by common name.
    pub fn sorted() -> Vec<AccessMode> {
        let mut modes = Self::VALUES.to_vec();
        modes.sort_by_key(|mode| mode.common_name());
        modes
    }

    /// Modes a viewer may pick, ordered by common name. Excludes [`AccessMode::All`].
    pub fn selectable() -> Vec<AccessMode> {
        Self::sorted()
            .into_iter()
            .filter(|mode| *mode != AccessMode::All)
            .collect()
    }

    pub const fn allows_input(self) -> bool {
        matches!(self, AccessMode::FullControl | AccessMode::All)
    }

    pub const fn allows_chat(self) -> bool {
        !matches!(self, AccessMode::ViewOnly)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.common_name())
    }
}

impl FromStr for AccessMode {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::VALUES
            .into_iter()
            .find(|mode| mode.common_name() == s)
            .ok_or_else(|| TesseraError::Decode(format!("unknown access mode {s:?}")))
    }
}

// ── DisplayManager ───────────────────────────────────────────────

/// Produces a fresh capture handle for one display.
pub type DisplayFactory =
    Box<dyn Fn() -> Result<Box<dyn DisplayCapture>, TesseraError> + Send + Sync>;

/// Identifies a connected viewer to the manager.
pub type ClientId = u64;

struct ClientBinding {
    screen: u32,
    binding: BindingId,
    mode: AccessMode,
    refresh: Option<Duration>,
    monitor: Arc<ScreenMonitor>,
}

#[derive(Default)]
struct ManagerState {
    monitors: HashMap<u32, Arc<ScreenMonitor>>,
    clients: HashMap<ClientId, ClientBinding>,
}

/// Owns monitors and viewer bindings for every configured display.
pub struct DisplayManager {
    factories: Vec<DisplayFactory>,
    config: MonitorConfig,
    default_refresh: Option<Duration>,
    password: Option<blake3::Hash>,
    state: Mutex<ManagerState>,
}

impl DisplayManager {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            factories: Vec::new(),
            config,
            default_refresh: None,
            password: None,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Register a display; it gets the next screen index.
    pub fn add_display(&mut self, factory: DisplayFactory) -> u32 {
        self.factories.push(factory);
        (self.factories.len() - 1) as u32
    }

    /// Require this password from every viewer.
    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(blake3::hash(password.as_bytes()));
        self
    }

    /// Refresh request registered for a viewer until it sends its own.
    pub fn with_default_refresh(mut self, period: Duration) -> Self {
        self.default_refresh = Some(period);
        self
    }

    pub fn screen_count(&self) -> usize {
        self.factories.len()
    }

    /// Number of displays currently being captured.
    pub fn monitor_count(&self) -> usize {
        self.lock().monitors.len()
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authorized(&self, password: Option<&str>) -> bool {
        match (&self.password, password) {
            (None, _) => true,
            (Some(expected), Some(given)) => *expected == blake3::hash(given.as_bytes()),
            (Some(_), None) => false,
        }
    }

    /// Attach `client` to `screen`, replacing any previous binding.
    ///
    /// Returns `Ok(None)` when the credentials are rejected. Must run
    /// inside a Tokio runtime: the first viewer of a display starts its
    /// capture loop.
    pub fn bind(
        &self,
        client: ClientId,
        listener: Arc<dyn ScreenListener>,
        screen: u32,
        mode: AccessMode,
        password: Option<&str>,
    ) -> Result<Option<Arc<ScreenMonitor>>, TesseraError> {
        let factory = self
            .factories
            .get(screen as usize)
            .ok_or(TesseraError::UnknownScreen(screen))?;
        if !self.authorized(password) {
            warn!(client, screen, "credentials rejected");
            return Ok(None);
        }

        self.unbind(client);

        let mut state = self.lock();
        let monitor = match state.monitors.get(&screen) {
            Some(monitor) => Arc::clone(monitor),
            None => {
                let monitor = Arc::new(ScreenMonitor::new(factory()?, self.config.clone()));
                monitor.start();
                info!(screen, display = monitor.name(), "display capture started");
                state.monitors.insert(screen, Arc::clone(&monitor));
                monitor
            }
        };

        let binding = monitor.bind(listener);
        if self.default_refresh.is_some() {
            monitor.throttle(true, self.default_refresh);
        }
        state.clients.insert(
            client,
            ClientBinding {
                screen,
                binding,
                mode,
                refresh: self.default_refresh,
                monitor: Arc::clone(&monitor),
            },
        );
        debug!(client, screen, %mode, "viewer bound");
        Ok(Some(monitor))
    }

    /// Detach `client`. Retires the display's monitor if it was the last viewer.
    pub fn unbind(&self, client: ClientId) {
        let mut state = self.lock();
        let Some(bound) = state.clients.remove(&client) else {
            return;
        };
        if bound.refresh.is_some() {
            bound.monitor.throttle(false, bound.refresh);
        }
        if bound.monitor.unbind(bound.binding) > 0 {
            return;
        }

        state.monitors.remove(&bound.screen);
        drop(state);
        bound.monitor.stop();
        info!(screen = bound.screen, "display capture stopped");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let monitor = bound.monitor;
            runtime.spawn(async move { monitor.join().await });
        }
    }

    /// Replace `client`'s refresh request. `None` withdraws it.
    pub fn set_refresh_rate(&self, client: ClientId, period: Option<Duration>) {
        let mut state = self.lock();
        let Some(bound) = state.clients.get_mut(&client) else {
            return;
        };
        if bound.refresh.is_some() {
            bound.monitor.throttle(false, bound.refresh);
        }
        if period.is_some() {
            bound.monitor.throttle(true, period);
        }
        bound.refresh = period;
    }

    pub fn mode(&self, client: ClientId) -> Option<AccessMode> {
        self.lock().clients.get(&client).map(|bound| bound.mode)
    }

    /// Whether `client` is still waiting for its first full render.
    pub fn is_new(&self, client: ClientId) -> Option<bool> {
        let state = self.lock();
        let bound = state.clients.get(&client)?;
        bound.monitor.is_new(bound.binding)
    }

    /// Force (or cancel) a full render for `client` on the next cycle.
    pub fn set_is_new(&self, client: ClientId, is_new: bool) -> bool {
        let state = self.lock();
        state
            .clients
            .get(&client)
            .is_some_and(|bound| bound.monitor.set_is_new(bound.binding, is_new))
    }

    /// Current contents of a tile on a display that is being captured.
    pub fn segment_optimized(
        &self,
        screen: u32,
        id: SegmentId,
    ) -> Result<SegmentData, TesseraError> {
        let monitor = self
            .lock()
            .monitors
            .get(&screen)
            .cloned()
            .ok_or(TesseraError::UnknownScreen(screen))?;
        monitor.segment_optimized(id)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MemoryDisplay;
    use crate::changeset::ChangeSet;
    use crate::geometry::Rect;
    use crate::payload::SharedPayload;

    struct Quiet;

    impl ScreenListener for Quiet {
        fn on_screen_change(&self, _: &ChangeSet) {}
        fn on_display_event(&self, _: &SharedPayload) {}
    }

    fn manager() -> DisplayManager {
        let mut manager = DisplayManager::new(MonitorConfig {
            segment_width: 8,
            segment_height: 8,
            min_refresh: Duration::from_millis(5),
            ..MonitorConfig::default()
        })
        .with_default_refresh(Duration::from_millis(100));
        for name in ["left", "right"] {
            manager.add_display(Box::new(move || {
                let (display, _) = MemoryDisplay::new(name, Rect::new(0, 0, 16, 16), 0);
                Ok(Box::new(display) as Box<dyn DisplayCapture>)
            }));
        }
        manager
    }

    #[test]
    fn access_mode_ordering_and_names() {
        assert_eq!(
            AccessMode::sorted(),
            vec![
                AccessMode::All,
                AccessMode::FullControl,
                AccessMode::ViewAndChat,
                AccessMode::ViewOnly,
            ]
        );
        assert_eq!(
            AccessMode::selectable(),
            vec![
                AccessMode::FullControl,
                AccessMode::ViewAndChat,
                AccessMode::ViewOnly,
            ]
        );
        assert_eq!("*".parse::<AccessMode>().unwrap(), AccessMode::All);
        assert_eq!(
            "FULL_CONTROL".parse::<AccessMode>().unwrap(),
            AccessMode::FullControl
        );
        assert!("full_control".parse::<AccessMode>().is_err());
        assert!(AccessMode::All.allows_input());
        assert!(!AccessMode::ViewAndChat.allows_input());
        assert!(!AccessMode::ViewOnly.allows_chat());
    }

    #[tokio::test]
    async fn first_bind_starts_last_unbind_retires() {
        let manager = manager();
        let a = manager
            .bind(1, Arc::new(Quiet), 0, AccessMode::ViewOnly, None)
            .unwrap()
            .unwrap();
        let b = manager
            .bind(2, Arc::new(Quiet), 0, AccessMode::FullControl, None)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.monitor_count(), 1);
        assert_eq!(manager.mode(2), Some(AccessMode::FullControl));

        manager.unbind(1);
        assert!(a.is_running());
        manager.unbind(2);
        assert_eq!(manager.monitor_count(), 0);
        assert!(!a.is_running());
        assert_eq!(manager.mode(2), None);
    }

    #[tokio::test]
    async fn rebinding_moves_viewer() {
        let manager = manager();
        let left = manager
            .bind(1, Arc::new(Quiet), 0, AccessMode::ViewOnly, None)
            .unwrap()
            .unwrap();
        let right = manager
            .bind(1, Arc::new(Quiet), 1, AccessMode::ViewOnly, None)
            .unwrap()
            .unwrap();
        assert!(!left.is_running());
        assert_eq!(right.name(), "right");
        assert_eq!(manager.monitor_count(), 1);
        manager.unbind(1);
    }

    #[tokio::test]
    async fn refresh_requests_replace_previous() {
        let manager = manager();
        let monitor = manager
            .bind(1, Arc::new(Quiet), 0, AccessMode::ViewOnly, None)
            .unwrap()
            .unwrap();
        assert_eq!(monitor.refresh_period(), Duration::from_millis(100));

        manager.set_refresh_rate(1, Some(Duration::from_millis(20)));
        assert_eq!(monitor.refresh_period(), Duration::from_millis(20));
        manager.set_refresh_rate(1, Some(Duration::from_millis(500)));
        assert_eq!(monitor.refresh_period(), Duration::from_millis(500));
        manager.set_refresh_rate(1, None);
        assert_eq!(monitor.refresh_period(), MonitorConfig::default().idle_refresh);
        manager.unbind(1);
    }

    #[tokio::test]
    async fn password_is_checked() {
        let manager = manager().with_password("hunter2");
        assert!(manager
            .bind(1, Arc::new(Quiet), 0, AccessMode::ViewOnly, None)
            .unwrap()
            .is_none());
        assert!(manager
            .bind(1, Arc::new(Quiet), 0, AccessMode::ViewOnly, Some("nope"))
            .unwrap()
            .is_none());
        assert!(manager
            .bind(1, Arc::new(Quiet), 0, AccessMode::ViewOnly, Some("hunter2"))
            .unwrap()
            .is_some());
        assert_eq!(manager.monitor_count(), 1);
        manager.unbind(1);
    }

    #[test]
    fn unknown_screen() {
        let manager = manager();
        assert!(matches!(
            manager.bind(1, Arc::new(Quiet), 7, AccessMode::ViewOnly, None),
            Err(TesseraError::UnknownScreen(7))
        ));
        assert!(matches!(
            manager.segment_optimized(0, 0),
            Err(TesseraError::UnknownScreen(0))
        ));
    }

    #[tokio::test]
    async fn is_new_follows_binding() {
        let manager = manager();
        let monitor = manager
            .bind(1, Arc::new(Quiet), 0, AccessMode::ViewOnly, None)
            .unwrap()
            .unwrap();
        assert_eq!(manager.is_new(1), Some(true));
        monitor.run_cycle();
        assert_eq!(manager.is_new(1), Some(false));
        assert!(manager.set_is_new(1, true));
        assert_eq!(manager.is_new(1), Some(true));
        assert_eq!(manager.is_new(9), None);
        manager.unbind(1);
    }
}
