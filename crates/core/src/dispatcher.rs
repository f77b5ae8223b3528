//! Event routing between modules.
//!
//! The dispatcher is the single pump of a scan. It owns the event queue, the
//! in-flight counter and the set of running handler tasks; nothing else
//! mutates them.
//!
//! An event is *in flight* from the moment it is submitted until every
//! handler invoked for it has returned. A handler submits derived events
//! before it returns, so the scan is complete exactly when the counter is
//! zero and the submission channel is empty.
//!
//! ```text
//! submit ──► queue ──► dispatch ──► handler tasks ──► emit ──┐
//!   ▲                                                        │
//!   └──────────────────── submission channel ◄───────────────┘
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::event::{Event, Provenance};
use crate::metrics as m;
use crate::module::{DynModule, ModuleContext};
use crate::process::ProcessStreamer;
use crate::scope::ScopeFilter;
use crate::wordcloud::WordCloud;

/// Default time allowed for in-flight handlers to finish after cancellation.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Directories handed to module contexts.
#[derive(Debug, Clone)]
pub struct ScanDirs {
    /// Scan home; module `x` writes under `<home>/x`
    pub home: PathBuf,
    pub tools_dir: PathBuf,
}

/// A handler invocation that returned an error or panicked.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleFailure {
    pub module: String,
    pub event_id: Uuid,
    pub reason: String,
}

/// Counters shared with status queries.
#[derive(Debug, Default)]
pub struct DispatchStats {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    findings: AtomicU64,
    failures: AtomicU64,
    in_flight: AtomicUsize,
}

impl DispatchStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn findings(&self) -> u64 {
        self.findings.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Summary of one `run`.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub submitted: u64,
    pub dispatched: u64,
    pub findings: u64,
    pub failures: Vec<ModuleFailure>,
    /// Cancellation was observed before the queue drained
    pub cancelled: bool,
}

struct ModuleSlot {
    module: Arc<dyn DynModule>,
    ctx: ModuleContext,
}

struct HandlerDone {
    event_id: Uuid,
    module: String,
    outcome: Result<(), String>,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Dispatcher {
    slots: Vec<ModuleSlot>,
    scope: Arc<dyn ScopeFilter>,
    submit_tx: mpsc::UnboundedSender<Event>,
    submit_rx: mpsc::UnboundedReceiver<Event>,
    queue: VecDeque<Arc<Event>>,
    in_flight: usize,
    /// Handlers still running, per event
    pending: HashMap<Uuid, usize>,
    handlers: JoinSet<HandlerDone>,
    provenance: Provenance,
    word_cloud: Option<Arc<WordCloud>>,
    stats: Arc<DispatchStats>,
    failures: Vec<ModuleFailure>,
    drain_timeout: Duration,
}

impl Dispatcher {
    /// Builds a context for every module. Contexts share `streamer`, so
    /// cancelling its token reaches every session the modules start.
    pub fn new(
        modules: Vec<Arc<dyn DynModule>>,
        scope: Arc<dyn ScopeFilter>,
        streamer: ProcessStreamer,
        dirs: &ScanDirs,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let slots = modules
            .into_iter()
            .map(|module| {
                let descriptor = module.descriptor();
                let ctx = ModuleContext::new(
                    descriptor,
                    submit_tx.clone(),
                    streamer.clone(),
                    dirs.home.join(&descriptor.name),
                    dirs.tools_dir.clone(),
                );
                ModuleSlot { module, ctx }
            })
            .collect();

        Self {
            slots,
            scope,
            submit_tx,
            submit_rx,
            queue: VecDeque::new(),
            in_flight: 0,
            pending: HashMap::new(),
            handlers: JoinSet::new(),
            provenance: Provenance::new(),
            word_cloud: None,
            stats: Arc::new(DispatchStats::default()),
            failures: Vec::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Feeds every accepted event to `cloud`.
    pub fn with_word_cloud(mut self, cloud: Arc<WordCloud>) -> Self {
        self.word_cloud = Some(cloud);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn module_count(&self) -> usize {
        self.slots.len()
    }

    /// Sender modules use to submit events; exposed for tests and tools
    /// that feed the scan from outside a handler.
    pub fn submitter(&self) -> mpsc::UnboundedSender<Event> {
        self.submit_tx.clone()
    }

    /// Enqueues `event` and counts it as in flight.
    pub fn submit(&mut self, event: Event) {
        self.provenance.record(&event);
        if let Some(cloud) = &self.word_cloud {
            cloud.absorb(&event);
        }

        let kind = event.kind();
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::EVENTS_SUBMITTED_TOTAL, m::LABEL_KIND => kind.as_str()).increment(1);
        if kind.is_result() {
            self.stats.findings.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::FINDINGS_TOTAL).increment(1);
            info!(module = %event.module(), "[{}] {}", kind, event.data());
        } else {
            debug!(module = %event.module(), event = %event, "event submitted");
        }

        self.in_flight += 1;
        self.publish_in_flight();
        self.queue.push_back(Arc::new(event));
    }

    /// Pumps events until nothing is in flight.
    ///
    /// Once `cancel` fires, queued and newly submitted events are discarded
    /// and running handlers get `drain_timeout` to return.
    ///
    /// # Errors
    ///
    /// [`DispatchError`] on broken in-flight accounting or when the drain
    /// does not finish in time. Handler errors are not errors here; they are
    /// listed in the report.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<DispatchReport, DispatchError> {
        let mut deadline: Option<Instant> = None;

        loop {
            while let Ok(event) = self.submit_rx.try_recv() {
                self.submit(event);
            }

            if deadline.is_none() && cancel.is_cancelled() {
                info!(
                    in_flight = self.in_flight,
                    handlers = self.handlers.len(),
                    "cancellation requested, draining"
                );
                deadline = Some(Instant::now() + self.drain_timeout);
            }

            while let Some(event) = self.queue.pop_front() {
                if deadline.is_some() {
                    debug!(event = %event, "discarding event while draining");
                    self.settle(event.id())?;
                } else {
                    self.dispatch(event)?;
                }
            }

            if self.in_flight == 0 {
                break;
            }
            if self.handlers.is_empty() {
                return Err(DispatchError::HandlerLost {
                    reason: format!("{} events in flight with no running handler", self.in_flight),
                });
            }

            let sleep_target = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                Some(event) = self.submit_rx.recv() => self.submit(event),
                Some(joined) = self.handlers.join_next() => self.complete(joined)?,
                _ = cancel.cancelled(), if deadline.is_none() => {}
                _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                    let remaining = self.in_flight;
                    warn!(remaining, "drain timed out, aborting handlers");
                    self.handlers.abort_all();
                    return Err(DispatchError::DrainTimeout {
                        secs: self.drain_timeout.as_secs(),
                        remaining,
                    });
                }
            }
        }

        Ok(DispatchReport {
            submitted: self.stats.submitted(),
            dispatched: self.stats.dispatched(),
            findings: self.stats.findings(),
            failures: self.failures.clone(),
            cancelled: deadline.is_some(),
        })
    }

    /// Starts a handler for every module that wants `event`.
    fn dispatch(&mut self, event: Arc<Event>) -> Result<(), DispatchError> {
        let kind = event.kind();
        let targets: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                let d = slot.module.descriptor();
                d.watches_kind(kind)
                    && d.name != event.module()
                    && (!d.in_scope_only || self.scope.in_scope(&event))
            })
            .map(|(i, _)| i)
            .collect();

        if targets.is_empty() {
            return self.settle(event.id());
        }

        self.pending.insert(event.id(), targets.len());
        for i in targets {
            let slot = &self.slots[i];
            let name = slot.module.descriptor().name.clone();
            let module = Arc::clone(&slot.module);
            let ctx = slot.ctx.clone();
            let event_id = event.id();
            let event = Arc::clone(&event);

            self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::EVENTS_DISPATCHED_TOTAL, m::LABEL_MODULE => name.clone()).increment(1);
            debug!(module = %name, event = %event, "dispatching");

            // The inner task isolates panics; the outer one always reports.
            self.handlers.spawn(async move {
                let inner = tokio::spawn(async move { module.handle_event(event, ctx).await });
                let _guard = AbortOnDrop(inner.abort_handle());
                let outcome = match inner.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(e) => Err(describe_join_error(e)),
                };
                HandlerDone {
                    event_id,
                    module: name,
                    outcome,
                }
            });
        }
        Ok(())
    }

    fn complete(&mut self, joined: Result<HandlerDone, JoinError>) -> Result<(), DispatchError> {
        let done = joined.map_err(|e| DispatchError::HandlerLost {
            reason: e.to_string(),
        })?;

        if let Err(reason) = done.outcome {
            warn!(module = %done.module, event = %done.event_id, error = %reason, "module handler failed");
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::MODULE_FAILURES_TOTAL, m::LABEL_MODULE => done.module.clone())
                .increment(1);
            self.failures.push(ModuleFailure {
                module: done.module,
                event_id: done.event_id,
                reason,
            });
        }

        let remaining = self
            .pending
            .get_mut(&done.event_id)
            .ok_or_else(|| DispatchError::InFlightUnderflow {
                event_id: done.event_id.to_string(),
            })?;
        *remaining -= 1;
        if *remaining == 0 {
            self.pending.remove(&done.event_id);
            self.settle(done.event_id)?;
        }
        Ok(())
    }

    /// Marks `event_id` as fully handled.
    fn settle(&mut self, event_id: Uuid) -> Result<(), DispatchError> {
        self.in_flight = self
            .in_flight
            .checked_sub(1)
            .ok_or_else(|| DispatchError::InFlightUnderflow {
                event_id: event_id.to_string(),
            })?;
        self.publish_in_flight();
        Ok(())
    }

    fn publish_in_flight(&self) {
        self.stats.in_flight.store(self.in_flight, Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!(m::EVENTS_IN_FLIGHT).set(self.in_flight as f64);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("modules", &self.slots.len())
            .field("queued", &self.queue.len())
            .field("in_flight", &self.in_flight)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    let msg = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned());
    format!("handler panicked: {msg}")
}
