//! Typed publish/subscribe event bus.
//!
//! The bus is the only channel of communication between the runtimes: every
//! hop of the agent loop (task creation, LLM round-trips, tool execution,
//! agent teardown) is an event emitted here and consumed by whichever
//! runtime subscribed to its concrete type.
//!
//! # Architecture
//!
//! ```text
//! emit() ──▶ bounded event queue ──▶ dispatcher ──▶ bounded work queue ──▶ workers
//!             (capacity 100)          (per-type       (capacity 200)       (2 × CPU)
//!                                      fan-out)
//! ```
//!
//! [`EventBus::emit`] enqueues into a bounded FIFO and awaits space when the
//! queue is full, so producers are back-pressured rather than events dropped.
//! A single dispatcher task pops events, looks up the handlers registered for
//! the event's exact runtime type, and submits one `(event, handler)` work
//! item per subscriber to the worker pool. Handlers run concurrently; no
//! cross-event ordering is promised. Causal ordering within one agent comes
//! from the emit chain itself (each event is emitted by the handler of its
//! predecessor), not from the bus.
//!
//! # Shutdown
//!
//! [`EventBus::shutdown`] cancels intake, lets the dispatcher drain whatever
//! is still queued, then waits for the workers to finish the remaining work
//! items. Every event enqueued before the cancel is delivered to every
//! subscriber of its type before the drain completes.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentloop::EventBus;
//! use agentloop::agentloop::events::AgentStart;
//!
//! # async {
//! let bus = EventBus::new();
//! bus.subscribe(|event: AgentStart| async move {
//!     println!("agent {} started", event.agent_id);
//! });
//! bus.emit(AgentStart { agent_id: "agent0".into() }).await;
//! # };
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the emission FIFO. Emitters await space when it is full.
const EVENT_QUEUE_CAPACITY: usize = 100;
/// Capacity of the dispatcher → worker queue.
const WORK_QUEUE_CAPACITY: usize = 200;

/// How much the bus logs on each emission.
///
/// `Basic` logs one line per event (`[<agent_id>] Event emitted: <kind>`);
/// `Detailed` additionally dumps the event's fields. Timestamps come from
/// the installed `log` sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerboseLevel {
    Silent = 0,
    Basic = 1,
    Detailed = 2,
}

/// An event that can travel on the bus.
///
/// Every concrete event carries the ID of the agent it concerns, exposed via
/// [`agent_id`](Event::agent_id) for filtering and logging, and a static
/// [`kind`](Event::kind) name used in log lines. Dispatch is by the concrete
/// type, so a subscriber registered for `AgentFinish` never sees a
/// `TaskFinish`.
pub trait Event: Any + Send + Sync + fmt::Debug {
    /// ID of the agent this event concerns (may be empty for launcher-wide
    /// events such as shutdown).
    fn agent_id(&self) -> &str;
    /// Stable name of the event kind, e.g. `"LLMRequest"`.
    fn kind(&self) -> &'static str;
    /// Upcast used by the dispatcher to match subscribers by `TypeId`.
    fn as_any(&self) -> &dyn Any;
}

/// A type-erased subscriber: downcasts the shared event to its concrete type
/// and runs the user handler.
type CompiledHandler = Arc<dyn Fn(Arc<dyn Event>) -> BoxFuture<'static, ()> + Send + Sync>;

type HandlerMap = HashMap<TypeId, Vec<CompiledHandler>>;

struct Work {
    event: Arc<dyn Event>,
    handler: CompiledHandler,
}

/// Errors surfaced by the bus itself. Handler failures are never propagated
/// here; handlers are expected to emit an error event instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// `shutdown` deadline elapsed before the dispatcher and workers exited.
    ShutdownTimeout,
}

impl fmt::Display for EventBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventBusError::ShutdownTimeout => write!(f, "event bus shutdown deadline elapsed"),
        }
    }
}

impl std::error::Error for EventBusError {}

/// The typed pub/sub substrate. See the [module docs](self) for the dispatch
/// model and shutdown semantics.
pub struct EventBus {
    handlers: Arc<SyncRwLock<HandlerMap>>,
    event_tx: mpsc::Sender<Arc<dyn Event>>,
    cancel: CancellationToken,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
    verbose: AtomicU8,
}

impl EventBus {
    /// Spawn the dispatcher and worker tasks and return the ready bus.
    ///
    /// Must be called from within a Tokio runtime. The worker pool is sized
    /// at twice the number of CPUs.
    pub fn new() -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel::<Arc<dyn Event>>(EVENT_QUEUE_CAPACITY);
        let (work_tx, work_rx) = mpsc::channel::<Work>(WORK_QUEUE_CAPACITY);
        let handlers: Arc<SyncRwLock<HandlerMap>> = Arc::new(SyncRwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(dispatcher(
            event_rx,
            work_tx,
            Arc::clone(&handlers),
            cancel.clone(),
        )));

        let work_rx = Arc::new(Mutex::new(work_rx));
        for _ in 0..num_cpus::get() * 2 {
            tasks.push(tokio::spawn(worker(Arc::clone(&work_rx))));
        }

        Arc::new(Self {
            handlers,
            event_tx,
            cancel,
            tasks: SyncMutex::new(tasks),
            verbose: AtomicU8::new(VerboseLevel::Silent as u8),
        })
    }

    /// Set the emission-logging verbosity. Takes effect for subsequent
    /// emissions; safe to call at any time.
    pub fn with_verbose_level(&self, level: VerboseLevel) {
        self.verbose.store(level as u8, Ordering::Relaxed);
    }

    /// Register `handler` for every future event of concrete type `E`.
    ///
    /// Handlers for the same type run in registration order of submission to
    /// the pool, but may execute concurrently. Subscription is
    /// process-lifetime; there is no unsubscribe. Subscribing while the bus
    /// is already dispatching is allowed — the handler sees events emitted
    /// after the registration.
    pub fn subscribe<E, F, Fut>(&self, handler: F)
    where
        E: Event + Clone,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let compiled: CompiledHandler = Arc::new(move |event: Arc<dyn Event>| {
            let pending = event
                .as_any()
                .downcast_ref::<E>()
                .cloned()
                .map(|typed| handler(typed));
            Box::pin(async move {
                if let Some(invocation) = pending {
                    invocation.await;
                }
            })
        });
        self.handlers
            .write()
            .entry(TypeId::of::<E>())
            .or_default()
            .push(compiled);
    }

    /// Enqueue an event for dispatch, awaiting space if the queue is full.
    ///
    /// Returns once the event is enqueued (not once it is handled). After
    /// shutdown the event is silently discarded.
    pub async fn emit<E: Event>(&self, event: E) {
        self.emit_shared(Arc::new(event)).await;
    }

    /// [`emit`](EventBus::emit) for an already type-erased event. Runtimes
    /// use this to forward heterogeneous batches of follow-up events.
    pub async fn emit_shared(&self, event: Arc<dyn Event>) {
        let logged = Arc::clone(&event);
        if self.event_tx.send(event).await.is_err() {
            log::debug!("event bus is shut down, dropping {}", logged.kind());
            return;
        }
        self.log_event(&*logged);
    }

    /// Stop intake, drain the queue, and wait for the workers to finish.
    ///
    /// Returns [`EventBusError::ShutdownTimeout`] if `deadline` elapses
    /// first; the tasks keep draining in the background in that case.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), EventBusError> {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let drained = async move {
            for task in tasks {
                let _ = task.await;
            }
        };
        tokio::time::timeout(deadline, drained)
            .await
            .map_err(|_| EventBusError::ShutdownTimeout)
    }

    fn verbose_level(&self) -> VerboseLevel {
        match self.verbose.load(Ordering::Relaxed) {
            1 => VerboseLevel::Basic,
            2 => VerboseLevel::Detailed,
            _ => VerboseLevel::Silent,
        }
    }

    fn log_event(&self, event: &dyn Event) {
        match self.verbose_level() {
            VerboseLevel::Silent => {}
            VerboseLevel::Basic => {
                log::info!("[{}] Event emitted: {}", event.agent_id(), event.kind());
            }
            VerboseLevel::Detailed => {
                log::info!("----- Event emitted: {} -----", event.kind());
                log::info!("{:?}", event);
                log::info!("-------------------------");
            }
        }
    }
}

async fn dispatcher(
    mut event_rx: mpsc::Receiver<Arc<dyn Event>>,
    work_tx: mpsc::Sender<Work>,
    handlers: Arc<SyncRwLock<HandlerMap>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            received = event_rx.recv() => match received {
                Some(event) => dispatch_event(event, &handlers, &work_tx).await,
                None => break,
            },
            _ = cancel.cancelled() => {
                // Drain whatever was enqueued before the cancel so every
                // subscriber still observes it.
                while let Ok(event) = event_rx.try_recv() {
                    dispatch_event(event, &handlers, &work_tx).await;
                }
                break;
            }
        }
    }
    // Dropping `work_tx` here closes the work queue; workers exit once the
    // remaining items are consumed.
}

async fn dispatch_event(
    event: Arc<dyn Event>,
    handlers: &SyncRwLock<HandlerMap>,
    work_tx: &mpsc::Sender<Work>,
) {
    let matched: Vec<CompiledHandler> = {
        let map = handlers.read();
        map.get(&event.as_any().type_id()).cloned().unwrap_or_default()
    };
    for handler in matched {
        let item = Work {
            event: Arc::clone(&event),
            handler,
        };
        if work_tx.send(item).await.is_err() {
            return;
        }
    }
}

async fn worker(work_rx: Arc<Mutex<mpsc::Receiver<Work>>>) {
    loop {
        let next = {
            let mut rx = work_rx.lock().await;
            rx.recv().await
        };
        match next {
            Some(work) => (work.handler)(work.event).await,
            None => break,
        }
    }
}
