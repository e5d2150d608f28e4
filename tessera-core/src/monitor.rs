//! Per-display capture loop and change fan-out.
//!
//! A [`ScreenMonitor`] owns one display. Each cycle it:
//!
//! 1. re-reads the display bounds and rebuilds the tile layout on a
//!    resize (announcing it to every bound viewer);
//! 2. samples the pointer and announces moves / departures;
//! 3. compares every tile against its stored copy, recording changes
//!    in a [`ChangeSet`] and tracking solid-colour tiles;
//! 4. hands a snapshot of the change set to every initialised viewer,
//!    and a fully-set one to viewers bound since the last cycle;
//! 5. sleeps for whatever is left of the tightest refresh period any
//!    viewer asked for.
//!
//! Tile buffers never leave the monitor: viewers get copies, or a
//! shared compressed payload built from a copy.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::capture::DisplayCapture;
use crate::changeset::ChangeSet;
use crate::error::TesseraError;
use crate::event::{SegmentData, ServerEvent};
use crate::geometry::{Rect, SegmentId, Segmentation, WHOLE_SCREEN};
use crate::payload::{CompressedPayload, PayloadCache, SharedPayload};

/// Refresh period used while no viewer has asked for one.
pub const NO_LISTENER_PERIOD: Duration = Duration::from_millis(5000);

// ── MonitorConfig ────────────────────────────────────────────────

/// Configuration for [`ScreenMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Tile width in pixels.
    pub segment_width: u32,
    /// Tile height in pixels.
    pub segment_height: u32,
    /// Sleep between cycles to honour refresh requests.
    pub obey_speed_limits: bool,
    /// Floor applied to every refresh request.
    pub min_refresh: Duration,
    /// Period used when no viewer has a request registered.
    pub idle_refresh: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            segment_width: 64,
            segment_height: 64,
            obey_speed_limits: true,
            min_refresh: Duration::from_millis(40),
            idle_refresh: NO_LISTENER_PERIOD,
        }
    }
}

// ── ScreenListener ───────────────────────────────────────────────

/// Receiver of a monitor's notifications.
///
/// Both methods run on the capture loop and must not block; anything
/// slow belongs on the viewer's dispatch pipeline.
pub trait ScreenListener: Send + Sync {
    /// Tiles that changed during the last cycle. Called at most once per cycle.
    fn on_screen_change(&self, changes: &ChangeSet);

    /// A display-wide event (resize, cursor). The payload is shared by
    /// every viewer of this display.
    fn on_display_event(&self, payload: &SharedPayload);
}

/// Handle returned by [`ScreenMonitor::bind`].
pub type BindingId = u64;

struct Binding {
    id: BindingId,
    listener: Arc<dyn ScreenListener>,
    is_new: bool,
}

// ── Tiles ────────────────────────────────────────────────────────

struct Tile {
    pixels: Vec<u32>,
    solid: Option<u32>,
    /// Cycle in which the pixels last changed.
    version: u64,
}

impl Tile {
    fn blank(len: usize) -> Self {
        Self {
            pixels: vec![0; len],
            solid: Some(0),
            version: 0,
        }
    }

    /// Store `sample` if it differs, returning whether it did.
    ///
    /// `fill` is scratch space; its contents are clobbered.
    fn absorb(&mut self, sample: &[u32], fill: &mut Vec<u32>) -> bool {
        let changed = match self.solid {
            // Bulk-compare against a solid fill rather than walking pixels.
            Some(color) => {
                fill.clear();
                fill.resize(sample.len(), color);
                fill.as_slice() != sample
            }
            None => self.pixels.as_slice() != sample,
        };
        if changed {
            self.pixels.copy_from_slice(sample);
            self.solid = solid_color(sample, fill);
        }
        changed
    }
}

/// The single value of a constant buffer, if it is constant.
fn solid_color(pixels: &[u32], fill: &mut Vec<u32>) -> Option<u32> {
    let first = *pixels.first()?;
    fill.clear();
    fill.resize(pixels.len(), first);
    (fill.as_slice() == pixels).then_some(first)
}

// ── Cursor ───────────────────────────────────────────────────────

#[derive(Default)]
struct CursorState {
    /// `None` until the first sample.
    on_screen: Option<bool>,
    x: i32,
    y: i32,
}

impl CursorState {
    /// Fold in a display-relative sample, returning the event to announce.
    fn sync(&mut self, sample: Option<(i32, i32)>) -> Option<ServerEvent> {
        let was_on_screen = self.on_screen;
        match sample {
            Some((x, y)) => {
                let moved = was_on_screen != Some(true) || (x, y) != (self.x, self.y);
                self.on_screen = Some(true);
                self.x = x;
                self.y = y;
                moved.then_some(ServerEvent::CursorMove { x, y })
            }
            None => {
                self.on_screen = Some(false);
                (was_on_screen == Some(true)).then_some(ServerEvent::CursorGone)
            }
        }
    }

    fn position(&self) -> Option<(i32, i32)> {
        (self.on_screen == Some(true)).then_some((self.x, self.y))
    }
}

// ── Throttle ─────────────────────────────────────────────────────

/// Multiset of requested refresh periods; the shortest one wins.
struct Throttle {
    periods: BTreeMap<Duration, usize>,
    floor: Duration,
    idle: Duration,
}

impl Throttle {
    fn new(floor: Duration, idle: Duration) -> Self {
        Self {
            periods: BTreeMap::new(),
            floor,
            idle,
        }
    }

    fn current(&self) -> Duration {
        self.periods
            .keys()
            .next()
            .copied()
            .unwrap_or(self.idle)
    }

    fn update(&mut self, add: bool, period: Option<Duration>) {
        assert!(!add || period.is_some(), "cannot add an empty refresh request");
        let Some(period) = period else {
            return;
        };
        let period = period.max(self.floor);
        if add {
            *self.periods.entry(period).or_insert(0) += 1;
            return;
        }
        match self.periods.get_mut(&period) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.periods.remove(&period);
            }
            None => panic!("refresh period {period:?} was never requested"),
        }
    }
}

// ── Capture state ────────────────────────────────────────────────

struct CaptureState {
    display: Box<dyn DisplayCapture>,
    bounds: Option<Rect>,
    segmentation: Segmentation,
    tiles: Vec<Tile>,
    changed: ChangeSet,
    scratch: Vec<u32>,
    fill: Vec<u32>,
    cursor: CursorState,
    cycle: u64,
    last_change: u64,
}

impl CaptureState {
    /// Re-read the display bounds, rebuilding the layout on a size change.
    fn sync_bounds(&mut self, config: &MonitorConfig) -> Option<ServerEvent> {
        let bounds = self.display.screen_bounds();
        let previous = self.bounds.replace(bounds);
        if let Some(prev) = previous {
            if (prev.width, prev.height) == (bounds.width, bounds.height) {
                return None;
            }
        }

        self.segmentation.configure(
            bounds.width,
            bounds.height,
            config.segment_width,
            config.segment_height,
        );
        let count = self.segmentation.segment_count();
        self.tiles = (0..count)
            .map(|id| Tile::blank(self.segmentation.pixel_count(id as SegmentId)))
            .collect();
        self.changed = ChangeSet::new(count);
        self.scratch = vec![0; self.segmentation.max_pixel_count()];

        // The first layout is not a resize.
        previous?;
        self.changed.fill(true);
        Some(ServerEvent::ScreenResized {
            width: bounds.width,
            height: bounds.height,
        })
    }

    fn sync_cursor(&mut self) -> Option<ServerEvent> {
        let origin = self.bounds.unwrap_or_default();
        let sample = self
            .display
            .cursor_position()
            .map(|(x, y)| (x - origin.x, y - origin.y));
        self.cursor.sync(sample)
    }

    /// Sample every tile. The first failure abandons the rest of the pass.
    fn scan_tiles(&mut self) -> Result<(), TesseraError> {
        let CaptureState {
            display,
            segmentation,
            tiles,
            changed,
            scratch,
            fill,
            cycle,
            ..
        } = self;

        for (idx, tile) in tiles.iter_mut().enumerate() {
            let rect = segmentation.rect(idx as SegmentId);
            let sample = &mut scratch[..rect.area()];
            display.rgb_pixels(rect, sample)?;
            if tile.absorb(sample, fill) {
                changed.set(idx, true);
                tile.version = *cycle;
            }
        }
        Ok(())
    }

    fn check_segment(&self, id: SegmentId) -> Result<(), TesseraError> {
        if self.segmentation.is_valid(id) {
            Ok(())
        } else {
            Err(TesseraError::SegmentOutOfRange {
                id,
                count: self.segmentation.segment_count(),
            })
        }
    }
}

/// What one capture pass produced, delivered after the state lock is released.
struct CycleReport {
    events: Vec<ServerEvent>,
    changes: Option<ChangeSet>,
    segment_count: usize,
}

// ── Shared monitor state ─────────────────────────────────────────

struct MonitorShared {
    name: String,
    config: MonitorConfig,
    state: Mutex<CaptureState>,
    bindings: Mutex<Vec<Binding>>,
    throttle: Mutex<Throttle>,
    payloads: PayloadCache<(SegmentId, u64)>,
    next_binding: AtomicU64,
    stopped: AtomicBool,
    joined: AtomicBool,
    wake: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MonitorShared {
    fn capture(&self) -> CycleReport {
        let mut state = lock(&self.state);
        let mut events = Vec::new();

        state.display.mark_cache_dirty();
        events.extend(state.sync_bounds(&self.config));
        events.extend(state.sync_cursor());

        state.cycle += 1;
        if let Err(e) = state.scan_tiles() {
            warn!(display = %self.name, "capture pass abandoned: {e}");
        }

        let changes = if state.changed.any() {
            let snapshot = state.changed.clone();
            state.changed.fill(false);
            state.last_change = state.cycle;
            Some(snapshot)
        } else {
            None
        };

        CycleReport {
            events,
            changes,
            segment_count: state.segmentation.segment_count(),
        }
    }

    fn notify(&self, report: CycleReport) {
        let targets: Vec<(Arc<dyn ScreenListener>, bool)> = lock(&self.bindings)
            .iter_mut()
            .map(|binding| {
                let was_new = std::mem::replace(&mut binding.is_new, false);
                (Arc::clone(&binding.listener), was_new)
            })
            .collect();

        for event in report.events {
            trace!(display = %self.name, ?event, "display event");
            // Compress here, once, rather than on every viewer's lane.
            let payload = match CompressedPayload::precompiled(event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(display = %self.name, "dropping display event: {e}");
                    continue;
                }
            };
            for (listener, _) in &targets {
                listener.on_display_event(&payload);
            }
        }

        if let Some(changes) = &report.changes {
            trace!(display = %self.name, tiles = changes.count(), "tiles changed");
            for (listener, _) in targets.iter().filter(|(_, was_new)| !was_new) {
                listener.on_screen_change(changes);
            }
        }

        if targets.iter().any(|(_, was_new)| *was_new) {
            let everything = ChangeSet::filled(report.segment_count);
            for (listener, _) in targets.iter().filter(|(_, was_new)| *was_new) {
                listener.on_screen_change(&everything);
            }
        }
    }

    fn refresh_period(&self) -> Duration {
        lock(&self.throttle).current()
    }
}

/// Marks the monitor stopped and joined however the loop exits.
struct ExitGuard(Arc<MonitorShared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.stopped.store(true, Ordering::SeqCst);
        self.0.joined.store(true, Ordering::SeqCst);
    }
}

async fn run_loop(shared: Arc<MonitorShared>) {
    let _exit = ExitGuard(Arc::clone(&shared));
    info!(display = %shared.name, "monitor started");

    while !shared.stopped.load(Ordering::SeqCst) {
        let started = Instant::now();
        // Display reads block; keep them off the runtime workers.
        let pass = tokio::task::spawn_blocking({
            let shared = Arc::clone(&shared);
            move || {
                let report = shared.capture();
                shared.notify(report);
            }
        })
        .await;
        if let Err(e) = pass {
            error!(display = %shared.name, "capture pass panicked: {e}");
            break;
        }

        if shared.config.obey_speed_limits {
            if let Some(rest) = shared.refresh_period().checked_sub(started.elapsed()) {
                tokio::select! {
                    _ = tokio::time::sleep(rest) => {}
                    _ = shared.wake.notified() => {}
                }
            }
        } else {
            tokio::task::yield_now().await;
        }
    }

    info!(display = %shared.name, "monitor stopped");
}

// ── ScreenMonitor ────────────────────────────────────────────────

/// Capture loop for one display.
///
/// # Lifetime
///
/// Created when a display gains its first viewer, [`start`](Self::start)ed,
/// and [`stop`](Self::stop)ped then [`join`](Self::join)ed when the last
/// viewer leaves.
pub struct ScreenMonitor {
    shared: Arc<MonitorShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ScreenMonitor {
    pub fn new(display: Box<dyn DisplayCapture>, config: MonitorConfig) -> Self {
        let name = display.name();
        let mut state = CaptureState {
            display,
            bounds: None,
            segmentation: Segmentation::new(config.segment_width, config.segment_height),
            tiles: Vec::new(),
            changed: ChangeSet::new(0),
            scratch: Vec::new(),
            fill: Vec::new(),
            cursor: CursorState::default(),
            cycle: 0,
            last_change: 0,
        };
        state.sync_bounds(&config);

        Self {
            shared: Arc::new(MonitorShared {
                name,
                throttle: Mutex::new(Throttle::new(config.min_refresh, config.idle_refresh)),
                config,
                state: Mutex::new(state),
                bindings: Mutex::new(Vec::new()),
                payloads: PayloadCache::new(),
                next_binding: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
                joined: AtomicBool::new(false),
                wake: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawn the capture loop on the current Tokio runtime. No-op if
    /// already started.
    pub fn start(&self) {
        let mut task = lock(&self.task);
        if task.is_none() {
            task.replace(tokio::spawn(run_loop(Arc::clone(&self.shared))));
        }
    }

    /// Run a single capture cycle and deliver its notifications.
    pub fn run_cycle(&self) {
        let report = self.shared.capture();
        self.shared.notify(report);
    }

    /// Ask the loop to exit after the current cycle.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Alias of [`stop`](Self::stop).
    pub fn kill(&self) {
        self.stop();
    }

    /// Wait for the capture loop to exit.
    pub async fn join(&self) {
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(display = %self.shared.name, "monitor task ended abnormally: {e}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst)
    }

    /// The loop has fully exited; the monitor can be discarded.
    pub fn is_joined(&self) -> bool {
        self.shared.joined.load(Ordering::SeqCst)
    }

    // ── Bindings ─────────────────────────────────────────────────

    /// Attach a viewer. It receives a full change set on the next cycle.
    pub fn bind(&self, listener: Arc<dyn ScreenListener>) -> BindingId {
        let id = self.shared.next_binding.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.bindings).push(Binding {
            id,
            listener,
            is_new: true,
        });
        debug!(display = %self.shared.name, binding = id, "viewer bound");
        id
    }

    /// Detach a viewer, returning how many remain.
    pub fn unbind(&self, id: BindingId) -> usize {
        let mut bindings = lock(&self.shared.bindings);
        bindings.retain(|binding| binding.id != id);
        debug!(display = %self.shared.name, binding = id, "viewer unbound");
        bindings.len()
    }

    /// Whether a binding is still waiting for its initial full render.
    pub fn is_new(&self, id: BindingId) -> Option<bool> {
        lock(&self.shared.bindings)
            .iter()
            .find(|binding| binding.id == id)
            .map(|binding| binding.is_new)
    }

    /// Set or clear a binding's pending full render. False if `id` is unknown.
    pub fn set_is_new(&self, id: BindingId, is_new: bool) -> bool {
        let mut bindings = lock(&self.shared.bindings);
        match bindings.iter_mut().find(|binding| binding.id == id) {
            Some(binding) => {
                binding.is_new = is_new;
                true
            }
            None => false,
        }
    }

    pub fn binding_count(&self) -> usize {
        lock(&self.shared.bindings).len()
    }

    // ── Rate limiting ────────────────────────────────────────────

    /// Register (`add`) or withdraw a viewer's minimum frame period.
    ///
    /// `None` leaves the rate untouched.
    ///
    /// # Panics
    ///
    /// Panics when withdrawing a period that is not registered, or when
    /// adding `None`.
    pub fn throttle(&self, add: bool, period: Option<Duration>) {
        let mut throttle = lock(&self.shared.throttle);
        throttle.update(add, period);
        debug!(display = %self.shared.name, period = ?throttle.current(), "refresh period");
    }

    /// The period the loop currently runs at.
    pub fn refresh_period(&self) -> Duration {
        self.shared.refresh_period()
    }

    // ── Segment access ───────────────────────────────────────────

    pub fn segmentation(&self) -> Segmentation {
        lock(&self.shared.state).segmentation
    }

    pub fn segment_count(&self) -> usize {
        lock(&self.shared.state).segmentation.segment_count()
    }

    /// Virtual-desktop position of the display's top-left corner.
    pub fn origin(&self) -> (i32, i32) {
        let bounds = lock(&self.shared.state).bounds.unwrap_or_default();
        (bounds.x, bounds.y)
    }

    /// A copy of a tile's pixels; [`WHOLE_SCREEN`] reads the display directly.
    pub fn segment(&self, id: SegmentId) -> Result<Vec<u32>, TesseraError> {
        let mut state = lock(&self.shared.state);
        state.check_segment(id)?;
        if id == WHOLE_SCREEN {
            return state.display.rgb_screen();
        }
        Ok(state.tiles[id as usize].pixels.clone())
    }

    /// The tile's colour if it is solid. Always `None` for [`WHOLE_SCREEN`].
    pub fn segment_solid_color(&self, id: SegmentId) -> Option<u32> {
        if id == WHOLE_SCREEN {
            return None;
        }
        let state = lock(&self.shared.state);
        state.tiles.get(usize::try_from(id).ok()?)?.solid
    }

    /// Solid colour when possible, pixels otherwise.
    pub fn segment_optimized(&self, id: SegmentId) -> Result<SegmentData, TesseraError> {
        match self.segment_solid_color(id) {
            Some(color) => Ok(SegmentData::Solid(color)),
            None => self.segment(id).map(SegmentData::Pixels),
        }
    }

    /// A shared `SegmentUpdate` payload for the tile's current contents.
    ///
    /// Viewers asking for the same version of a tile share one compressed body.
    pub fn segment_payload(&self, id: SegmentId) -> Result<SharedPayload, TesseraError> {
        let version = {
            let state = lock(&self.shared.state);
            state.check_segment(id)?;
            if id == WHOLE_SCREEN {
                state.last_change
            } else {
                state.tiles[id as usize].version
            }
        };
        self.shared
            .payloads
            .get_or_try_insert_with((id, version), || {
                Ok(ServerEvent::SegmentUpdate {
                    segment: id,
                    data: self.segment_optimized(id)?,
                })
            })
    }

    /// Events a freshly bound viewer needs before any tile traffic.
    pub fn display_init_events(&self) -> Vec<ServerEvent> {
        let state = lock(&self.shared.state);
        let bounds = state.bounds.unwrap_or_default();
        let mut events = vec![
            ServerEvent::ScreenResized {
                width: bounds.width,
                height: bounds.height,
            },
            ServerEvent::SegmentSizeUpdate {
                width: self.shared.config.segment_width,
                height: self.shared.config.segment_height,
            },
        ];
        if let Some((x, y)) = state.cursor.position() {
            events.push(ServerEvent::CursorMove { x, y });
        }
        events
    }
}

impl Drop for ScreenMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MemoryDisplay, MemoryDisplayHandle};

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<ChangeSet>>,
        events: Mutex<Vec<ServerEvent>>,
    }

    impl ScreenListener for Recorder {
        fn on_screen_change(&self, changes: &ChangeSet) {
            self.changes.lock().unwrap().push(changes.clone());
        }

        fn on_display_event(&self, payload: &SharedPayload) {
            assert!(payload.is_compiled());
            self.events.lock().unwrap().push(payload.event().clone());
        }
    }

    impl Recorder {
        fn take_changes(&self) -> Vec<ChangeSet> {
            std::mem::take(&mut *self.changes.lock().unwrap())
        }

        fn take_events(&self) -> Vec<ServerEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            segment_width: 4,
            segment_height: 4,
            obey_speed_limits: true,
            min_refresh: Duration::from_millis(10),
            idle_refresh: Duration::from_millis(1000),
        }
    }

    /// 8×8 display (2×2 tiles of 4×4) filled with `fill`.
    fn monitor(fill: u32) -> (ScreenMonitor, MemoryDisplayHandle) {
        let (display, handle) = MemoryDisplay::new("test", Rect::new(0, 0, 8, 8), fill);
        (ScreenMonitor::new(Box::new(display), config()), handle)
    }

    fn bound(monitor: &ScreenMonitor) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        monitor.bind(recorder.clone());
        recorder
    }

    #[test]
    fn new_viewer_gets_full_set_once() {
        let (monitor, _display) = monitor(0xFF000000);
        let viewer = bound(&monitor);

        monitor.run_cycle();
        let changes = viewer.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].count(), 4);

        monitor.run_cycle();
        assert!(viewer.take_changes().is_empty());
    }

    #[test]
    fn single_pixel_marks_exactly_one_tile() {
        let (monitor, display) = monitor(0xFF0000FF);
        let viewer = bound(&monitor);
        monitor.run_cycle();
        viewer.take_changes();
        for id in 0..4 {
            assert_eq!(monitor.segment_solid_color(id), Some(0xFF0000FF));
        }

        display.set_pixel(5, 6, 0xFFFFFFFF);
        monitor.run_cycle();

        let changes = viewer.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].iter_ones().collect::<Vec<_>>(), vec![3]);
        assert_eq!(monitor.segment_solid_color(3), None);
        for id in 0..3 {
            assert_eq!(monitor.segment_solid_color(id), Some(0xFF0000FF));
        }
    }

    #[test]
    fn solid_detection() {
        let (monitor, display) = monitor(0);
        display.fill_rect(Rect::new(0, 0, 4, 4), 0xFF123456);
        display.set_pixel(4, 0, 1);
        monitor.run_cycle();

        assert_eq!(monitor.segment_solid_color(0), Some(0xFF123456));
        assert_eq!(monitor.segment_solid_color(1), None);
        assert_eq!(
            monitor.segment_optimized(0).unwrap(),
            SegmentData::Solid(0xFF123456)
        );
        match monitor.segment_optimized(1).unwrap() {
            SegmentData::Pixels(px) => {
                assert_eq!(px.len(), 16);
                assert_eq!(px[0], 1);
            }
            other => panic!("expected pixels, got {other:?}"),
        }
    }

    #[test]
    fn resize_rebuilds_layout_and_announces() {
        let (monitor, display) = monitor(7);
        let viewer = bound(&monitor);
        monitor.run_cycle();
        viewer.take_changes();

        display.resize(12, 8, 7);
        monitor.run_cycle();

        assert_eq!(
            viewer.take_events(),
            vec![ServerEvent::ScreenResized {
                width: 12,
                height: 8
            }]
        );
        assert_eq!(monitor.segment_count(), 6);
        let changes = viewer.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].count(), 6);
    }

    #[test]
    fn cursor_move_and_gone() {
        let (monitor, display) = monitor(0);
        let viewer = bound(&monitor);

        display.move_cursor(Some((2, 3)));
        monitor.run_cycle();
        monitor.run_cycle();
        display.move_cursor(Some((4, 3)));
        monitor.run_cycle();
        display.move_cursor(None);
        monitor.run_cycle();
        monitor.run_cycle();

        assert_eq!(
            viewer.take_events(),
            vec![
                ServerEvent::CursorMove { x: 2, y: 3 },
                ServerEvent::CursorMove { x: 4, y: 3 },
                ServerEvent::CursorGone,
            ]
        );
    }

    #[test]
    fn capture_failure_abandons_pass_but_not_monitor() {
        let (monitor, display) = monitor(0);
        let viewer = bound(&monitor);
        monitor.run_cycle();
        viewer.take_changes();

        display.set_pixel(0, 0, 9);
        display.set_pixel(7, 7, 9);
        display.fail_next_captures(1);
        monitor.run_cycle();
        assert!(viewer.take_changes().is_empty());

        monitor.run_cycle();
        let changes = viewer.take_changes();
        assert_eq!(changes[0].iter_ones().collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn throttle_runs_at_tightest_request() {
        let (monitor, _display) = monitor(0);
        assert_eq!(monitor.refresh_period(), Duration::from_millis(1000));

        monitor.throttle(true, Some(Duration::from_millis(100)));
        monitor.throttle(true, Some(Duration::from_millis(30)));
        monitor.throttle(true, Some(Duration::from_millis(30)));
        assert_eq!(monitor.refresh_period(), Duration::from_millis(30));

        monitor.throttle(false, Some(Duration::from_millis(30)));
        assert_eq!(monitor.refresh_period(), Duration::from_millis(30));
        monitor.throttle(false, Some(Duration::from_millis(30)));
        assert_eq!(monitor.refresh_period(), Duration::from_millis(100));

        monitor.throttle(false, None);
        monitor.throttle(false, Some(Duration::from_millis(100)));
        assert_eq!(monitor.refresh_period(), Duration::from_millis(1000));
    }

    #[test]
    fn throttle_clamps_to_floor() {
        let (monitor, _display) = monitor(0);
        monitor.throttle(true, Some(Duration::from_millis(1)));
        assert_eq!(monitor.refresh_period(), Duration::from_millis(10));
        monitor.throttle(false, Some(Duration::from_millis(2)));
        assert_eq!(monitor.refresh_period(), Duration::from_millis(1000));
    }

    #[test]
    #[should_panic(expected = "never requested")]
    fn throttle_removing_unknown_period_panics() {
        let (monitor, _display) = monitor(0);
        monitor.throttle(false, Some(Duration::from_millis(250)));
    }

    #[test]
    fn segment_payload_shared_until_tile_changes() {
        let (monitor, display) = monitor(0);
        monitor.run_cycle();

        let a = monitor.segment_payload(2).unwrap();
        let b = monitor.segment_payload(2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        display.set_pixel(0, 5, 3);
        monitor.run_cycle();
        let c = monitor.segment_payload(2).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(matches!(
            c.event(),
            ServerEvent::SegmentUpdate {
                segment: 2,
                data: SegmentData::Pixels(_)
            }
        ));
    }

    #[test]
    fn whole_screen_and_bad_ids() {
        let (monitor, _display) = monitor(5);
        monitor.run_cycle();
        assert_eq!(monitor.segment(WHOLE_SCREEN).unwrap().len(), 64);
        assert_eq!(monitor.segment_solid_color(WHOLE_SCREEN), None);
        assert!(matches!(
            monitor.segment(4),
            Err(TesseraError::SegmentOutOfRange { id: 4, count: 4 })
        ));
    }

    #[test]
    fn init_events_describe_display() {
        let (monitor, display) = monitor(0);
        display.move_cursor(Some((1, 1)));
        monitor.run_cycle();
        assert_eq!(
            monitor.display_init_events(),
            vec![
                ServerEvent::ScreenResized {
                    width: 8,
                    height: 8
                },
                ServerEvent::SegmentSizeUpdate {
                    width: 4,
                    height: 4
                },
                ServerEvent::CursorMove { x: 1, y: 1 },
            ]
        );
    }

    #[test]
    fn unbind_reports_remaining() {
        let (monitor, _display) = monitor(0);
        let a = monitor.bind(Arc::new(Recorder::default()));
        let b = monitor.bind(Arc::new(Recorder::default()));
        assert_eq!(monitor.is_new(a), Some(true));
        monitor.run_cycle();
        assert_eq!(monitor.is_new(a), Some(false));
        assert_eq!(monitor.unbind(a), 1);
        assert_eq!(monitor.unbind(b), 0);
        assert_eq!(monitor.is_new(a), None);
    }

    #[tokio::test]
    async fn loop_stops_and_joins() {
        let (monitor, display) = monitor(0);
        let viewer = bound(&monitor);
        monitor.throttle(true, Some(Duration::from_millis(10)));
        monitor.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        display.set_pixel(0, 0, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        monitor.stop();
        monitor.join().await;
        assert!(!monitor.is_running());
        assert!(monitor.is_joined());
        assert!(viewer.take_changes().len() >= 2);
    }

    #[test]
    fn cache_is_invalidated_once_per_cycle() {
        let (monitor, display) = monitor(0);
        let before = display.dirty_marks();
        for cycle in 1..=3 {
            monitor.run_cycle();
            assert_eq!(display.dirty_marks(), before + cycle);
        }
    }

    /// A display whose every tile read takes `delay`.
    struct SlowDisplay {
        inner: MemoryDisplay,
        delay: Duration,
    }

    impl DisplayCapture for SlowDisplay {
        fn screen_bounds(&mut self) -> Rect {
            self.inner.screen_bounds()
        }

        fn rgb_pixels(&mut self, rect: Rect, buf: &mut [u32]) -> Result<(), TesseraError> {
            std::thread::sleep(self.delay);
            self.inner.rgb_pixels(rect, buf)
        }

        fn rgb_screen(&mut self) -> Result<Vec<u32>, TesseraError> {
            self.inner.rgb_screen()
        }

        fn mark_cache_dirty(&mut self) {
            self.inner.mark_cache_dirty();
        }

        fn cursor_position(&mut self) -> Option<(i32, i32)> {
            self.inner.cursor_position()
        }

        fn name(&self) -> String {
            self.inner.name()
        }
    }

    #[tokio::test]
    async fn overrunning_passes_leave_the_runtime_responsive() {
        let (inner, _handle) = MemoryDisplay::new("slow", Rect::new(0, 0, 8, 8), 0);
        let display = SlowDisplay {
            inner,
            delay: Duration::from_millis(30),
        };
        let monitor = ScreenMonitor::new(Box::new(display), config());
        let _viewer = bound(&monitor);
        monitor.throttle(true, Some(Duration::from_millis(10)));
        monitor.start();

        let stopped = tokio::time::timeout(Duration::from_secs(3), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            monitor.stop();
            monitor.join().await;
        })
        .await;
        assert!(stopped.is_ok(), "runtime starved by the capture loop");
        assert!(monitor.is_joined());
    }
}
