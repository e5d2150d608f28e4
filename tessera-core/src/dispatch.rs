//! Per-connection outbound pipeline.
//!
//! ```text
//!                       ┌──────────────┐
//!  send_event ──┬─────▶ │ serial lane  │──┐
//!               │       └──────────────┘  │   ┌───────────┐
//!               │                         ├──▶│ send lock │──▶ socket
//!               │       ┌──────────────┐  │   └───────────┘
//!               └─────▶ │ coalescing   │──┘
//!                       │ lane         │
//!                       └──────▲───────┘
//!                              │ replay
//!  handle_event_ack ───────────┘
//! ```
//!
//! Serial events (connection, auth, resize, chat...) are numbered and
//! delivered in submission order. Everything else is keyed by
//! [`CoalesceKey`]: while a key is in flight (sent, not yet acknowledged)
//! further submissions for it are parked in a single pending slot, so a
//! tile that changes faster than the viewer can keep up costs at most
//! two sends per acknowledgement.
//!
//! Acknowledging a key drains the in-flight list from the head through
//! that key, resubmitting whatever was parked for each drained entry.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::SinkExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec::{Outbound, ServerCodec};
use crate::error::TesseraError;
use crate::event::{CoalesceKey, EventKind, ServerEvent};
use crate::payload::SharedPayload;

// ── Submissions ──────────────────────────────────────────────────

/// One thing to send: a plain event, or a body compressed once and
/// shared between viewers.
#[derive(Debug)]
enum Submission {
    Event(ServerEvent),
    Shared(SharedPayload),
}

impl Submission {
    fn event(&self) -> &ServerEvent {
        match self {
            Submission::Event(event) => event,
            Submission::Shared(payload) => payload.event(),
        }
    }

    fn into_outbound(self) -> Result<Outbound<ServerEvent>, TesseraError> {
        match self {
            Submission::Event(event) => Ok(Outbound::Message(event)),
            Submission::Shared(payload) => payload.bytes().map(Outbound::Precompiled),
        }
    }
}

struct Job {
    seq: Option<u32>,
    submission: Submission,
}

// ── Queue bookkeeping ────────────────────────────────────────────

struct Queues {
    seq: u32,
    /// Keys sent and not yet acknowledged.
    in_flight: HashSet<CoalesceKey>,
    /// At most one parked submission per in-flight key.
    pending: HashMap<CoalesceKey, Submission>,
    /// In-flight keys in dispatch order.
    order: VecDeque<CoalesceKey>,
    serial_tx: Option<mpsc::UnboundedSender<Job>>,
    coalescing_tx: Option<mpsc::UnboundedSender<Job>>,
}

impl Queues {
    /// Next serial number; wraps to zero instead of going negative.
    fn next_seq(&mut self) -> u32 {
        self.seq = match self.seq.checked_add(1) {
            Some(seq) if seq <= i32::MAX as u32 => seq,
            _ => 0,
        };
        self.seq
    }
}

struct PipelineShared<W> {
    queues: Mutex<Queues>,
    sink: tokio::sync::Mutex<FramedWrite<W, ServerCodec>>,
    /// Jobs handed to a lane and not yet picked up by its worker.
    queued: AtomicUsize,
    closed: AtomicBool,
    fatal: CancellationToken,
}

impl<W> PipelineShared<W> {
    fn queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, tx: &Option<mpsc::UnboundedSender<Job>>, job: Job) {
        let Some(tx) = tx else {
            trace!("pipeline disposed, dropping {:?}", job.submission.event().kind());
            return;
        };
        self.queued.fetch_add(1, Ordering::SeqCst);
        if tx.send(job).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> PipelineShared<W> {
    async fn write(&self, job: Job) -> Result<(), TesseraError> {
        let event = job.submission.event();
        let kind = event.kind();
        let denied = matches!(event, ServerEvent::AuthorizationUpdate { granted: false });
        let frame = job.submission.into_outbound()?;

        let mut sink = self.sink.lock().await;
        sink.feed(frame).await?;
        if self.queued.load(Ordering::SeqCst) == 0 || kind == EventKind::AuthorizationUpdate {
            sink.flush().await?;
        }
        trace!(?kind, seq = ?job.seq, "sent");

        if denied {
            debug!("authorization denied, closing connection");
            self.fatal.cancel();
        }
        Ok(())
    }
}

async fn run_lane<W: AsyncWrite + Unpin + Send + 'static>(
    shared: Arc<PipelineShared<W>>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    lane: &'static str,
) {
    while let Some(job) = rx.recv().await {
        shared.queued.fetch_sub(1, Ordering::SeqCst);
        if shared.closed.load(Ordering::SeqCst) {
            continue;
        }
        if let Err(e) = shared.write(job).await {
            warn!(lane, "send failed: {e}");
            shared.closed.store(true, Ordering::SeqCst);
            shared.fatal.cancel();
        }
    }
    trace!(lane, "lane finished");
}

// ── DispatchPipeline ─────────────────────────────────────────────

/// Outbound side of one viewer connection.
///
/// Must be created inside a Tokio runtime; it spawns one worker per lane.
pub struct DispatchPipeline<W> {
    shared: Arc<PipelineShared<W>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> DispatchPipeline<W> {
    pub fn new(writer: W) -> Self {
        let (serial_tx, serial_rx) = mpsc::unbounded_channel();
        let (coalescing_tx, coalescing_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PipelineShared {
            queues: Mutex::new(Queues {
                seq: 0,
                in_flight: HashSet::new(),
                pending: HashMap::new(),
                order: VecDeque::new(),
                serial_tx: Some(serial_tx),
                coalescing_tx: Some(coalescing_tx),
            }),
            sink: tokio::sync::Mutex::new(FramedWrite::new(writer, ServerCodec::new())),
            queued: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            fatal: CancellationToken::new(),
        });

        let workers = vec![
            tokio::spawn(run_lane(Arc::clone(&shared), serial_rx, "serial")),
            tokio::spawn(run_lane(Arc::clone(&shared), coalescing_rx, "coalescing")),
        ];
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn send_event(&self, event: ServerEvent) {
        self.submit(Submission::Event(event));
    }

    /// Send a payload shared with other viewers. The reference is held
    /// until the bytes are written or the slot is overwritten.
    pub fn send_payload(&self, payload: SharedPayload) {
        self.submit(Submission::Shared(payload));
    }

    fn submit(&self, submission: Submission) {
        let kind = submission.event().kind();
        let mut queues = self.shared.queues();

        if kind.is_serial() {
            let seq = queues.next_seq();
            let job = Job {
                seq: Some(seq),
                submission,
            };
            self.shared.push(&queues.serial_tx, job);
            return;
        }

        let job = |submission| Job {
            seq: None,
            submission,
        };
        if kind.bypasses_coalescing() {
            self.shared.push(&queues.coalescing_tx, job(submission));
            return;
        }

        let key = submission.event().coalesce_key();
        if queues.in_flight.insert(key) {
            queues.order.push_back(key);
            self.shared.push(&queues.coalescing_tx, job(submission));
            return;
        }

        // In flight: park it. Replaced or rejected submissions are
        // dropped after the lock is released.
        let _discarded = if kind.has_mutable_args() {
            queues.pending.insert(key, submission)
        } else if queues.pending.contains_key(&key) {
            Some(submission)
        } else {
            queues.pending.insert(key, submission)
        };
        drop(queues);
    }

    /// The viewer applied the event last sent under `key`.
    ///
    /// Drains in-flight keys from the oldest through `key` and resubmits
    /// their parked submissions in that order. Unknown keys are ignored.
    pub fn handle_event_ack(&self, key: CoalesceKey) {
        let replay = {
            let mut queues = self.shared.queues();
            if !queues.in_flight.contains(&key) {
                warn!(?key, "acknowledgement for an event not in flight");
                return;
            }
            let mut replay = Vec::new();
            while let Some(head) = queues.order.pop_front() {
                queues.in_flight.remove(&head);
                replay.extend(queues.pending.remove(&head));
                if head == key {
                    break;
                }
            }
            replay
        };

        trace!(?key, replayed = replay.len(), "ack");
        for submission in replay {
            self.submit(submission);
        }
    }

    /// Number of parked submissions.
    pub fn pending_count(&self) -> usize {
        self.shared.queues().pending.len()
    }

    /// Number of keys awaiting acknowledgement.
    pub fn in_flight_count(&self) -> usize {
        self.shared.queues().in_flight.len()
    }

    pub fn is_in_flight(&self, key: CoalesceKey) -> bool {
        self.shared.queues().in_flight.contains(&key)
    }

    /// Cancelled when the connection must be torn down: a write failed or
    /// the viewer's authorization was refused.
    pub fn fatal(&self) -> CancellationToken {
        self.shared.fatal.clone()
    }

    /// Stop accepting work and release every parked payload. Jobs already
    /// queued are dropped unsent.
    pub fn dispose(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let released = {
            let mut queues = self.shared.queues();
            queues.serial_tx = None;
            queues.coalescing_tx = None;
            queues.in_flight.clear();
            queues.order.clear();
            std::mem::take(&mut queues.pending)
        };
        debug!(released = released.len(), "pipeline disposed");
    }

    /// Wait for both lanes to finish, then shut the writer down.
    /// Call after [`dispose`](Self::dispose).
    pub async fn join(&self) {
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("pipeline worker ended abnormally: {e}");
            }
        }
        if let Err(e) = self.shared.sink.lock().await.get_mut().shutdown().await {
            debug!("closing writer: {e}");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
