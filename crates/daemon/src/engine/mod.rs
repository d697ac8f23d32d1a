// Execution engine: accepts dispatches, runs them on a bounded worker pool
// and drives each call through initial → in_process → completed | failed.
//
// Blocking units run on the blocking pool under a per-call timeout while the
// worker waits; async units are spawned as tasks bounded by a semaphore so
// they never hold a worker.

pub mod lifecycle;
pub mod shaping;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use mcpd_common::protocol::events::EventPayload;
use mcpd_common::types::{CallStatus, InboundRequest, McpFunctionCall, Partition};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use self::lifecycle::{CallRecorder, Failure};
use crate::config::ExecutionConfig;
use crate::entities::EntityService;
use crate::events::EventBus;
use crate::registry::{InvocationContext, ModuleRegistry, ResolvedUnit};
use crate::store::{BlobError, BlobStore, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("call {0} not found")]
    CallNotFound(Uuid),

    #[error("invalid call status transition {from} -> {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },

    #[error("stored call content is unreadable: {0}")]
    Content(String),

    #[error("call handle closed before the call finished")]
    HandleClosed,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),
}

// ── Handles ────────────────────────────────────────────────────────

/// Returned by `dispatch` before the call runs.
#[derive(Debug, Clone)]
pub struct CallHandle {
    pub call_uuid: Uuid,
    pub partition: Partition,
    accepted: CallStatus,
    deduplicated: bool,
    status: watch::Receiver<CallStatus>,
}

impl CallHandle {
    /// Status the call had when `dispatch` returned.
    pub fn accepted_status(&self) -> CallStatus {
        self.accepted
    }

    /// Latest status observed for the call.
    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    /// True when `dispatch` handed back an already pending call.
    pub fn was_deduplicated(&self) -> bool {
        self.deduplicated
    }

    /// Wait for the call to reach `completed` or `failed`.
    pub async fn wait(&mut self) -> Result<CallStatus, EngineError> {
        let status = self.status.wait_for(|status| status.is_terminal()).await.map_err(|_| EngineError::HandleClosed)?;
        Ok(*status)
    }

    fn duplicate(&self) -> Self {
        Self { accepted: self.status(), deduplicated: true, ..self.clone() }
    }
}

struct Job {
    call: McpFunctionCall,
    status: watch::Sender<CallStatus>,
    dedupe_key: Option<String>,
}

enum StoredContent {
    Inline(Value),
    External(String),
}

// ── Engine ─────────────────────────────────────────────────────────

pub struct Engine {
    inner: Arc<EngineInner>,
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct EngineInner {
    config: ExecutionConfig,
    registry: Arc<ModuleRegistry>,
    entities: Arc<EntityService>,
    bus: Arc<EventBus>,
    blobs: Arc<dyn BlobStore>,
    recorder: CallRecorder,
    async_slots: Arc<Semaphore>,
    async_capacity: u32,
    pending: Mutex<HashMap<(Partition, String), CallHandle>>,
}

impl Engine {
    /// Spawn the worker pool. Must be called from within a tokio runtime.
    pub fn start(
        config: ExecutionConfig,
        registry: Arc<ModuleRegistry>,
        entities: Arc<EntityService>,
        bus: Arc<EventBus>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let workers = config.workers.max(1);
        let async_capacity = u32::try_from(config.async_concurrency.max(1)).unwrap_or(u32::MAX);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let inner = Arc::new(EngineInner {
            recorder: CallRecorder::new(entities.clone(), bus.clone()),
            config,
            registry,
            entities,
            bus,
            blobs,
            async_slots: Arc::new(Semaphore::new(async_capacity as usize)),
            async_capacity,
            pending: Mutex::new(HashMap::new()),
        });

        let handles = (0..workers)
            .map(|worker| tokio::spawn(worker_loop(worker, inner.clone(), rx.clone())))
            .collect();
        info!(workers, queue_capacity = inner.config.queue_capacity, "execution engine started");

        Self { inner, queue: Mutex::new(Some(tx)), workers: Mutex::new(handles) }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.inner.config
    }

    /// Accept a request and queue it for execution.
    ///
    /// Returns once the `initial` record is stored and the job is queued;
    /// waits only when the submission queue is full.
    pub async fn dispatch(&self, request: InboundRequest) -> Result<CallHandle, EngineError> {
        let span = info_span!("engine.dispatch", partition = %request.partition, name = %request.name);
        self.dispatch_inner(request).instrument(span).await
    }

    async fn dispatch_inner(&self, request: InboundRequest) -> Result<CallHandle, EngineError> {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner).clone().ok_or(EngineError::ShuttingDown)?;

        let InboundRequest { partition, mcp_type, name, arguments, dedupe_key } = request;
        if let Some(existing) = self.inner.pending_call(&partition, dedupe_key.as_deref()) {
            return Ok(existing);
        }

        // Nothing is recorded until the queue has room, so a caller that
        // gives up while waiting leaves no trace.
        let permit = queue.reserve().await.map_err(|_| EngineError::ShuttingDown)?;

        let call = McpFunctionCall::new(partition.clone(), name, mcp_type, arguments);
        let (status_tx, status_rx) = watch::channel(CallStatus::Initial);
        let handle = CallHandle {
            call_uuid: call.call_uuid,
            partition: partition.clone(),
            accepted: CallStatus::Initial,
            deduplicated: false,
            status: status_rx,
        };

        let mut reservation = DedupeReservation { inner: &self.inner, partition: partition.clone(), key: None };
        if let Some(key) = &dedupe_key {
            let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = pending.get(&(partition.clone(), key.clone())) {
                info!(dedupe_key = %key, call_uuid = %existing.call_uuid, "request matches a pending call");
                return Ok(existing.duplicate());
            }
            pending.insert((partition.clone(), key.clone()), handle.clone());
            reservation.key = Some(key.clone());
        }

        self.inner.recorder.create(&call).await?;
        info!(call_uuid = %call.call_uuid, "call accepted");

        permit.send(Job { call, status: status_tx, dedupe_key });
        reservation.commit();
        Ok(handle)
    }

    /// Inline or externalized content of a finished call.
    pub async fn load_call_content(&self, partition: &Partition, call_uuid: Uuid) -> Result<Option<Value>, EngineError> {
        let call = self.inner.entities.call(partition, call_uuid).await?.ok_or(EngineError::CallNotFound(call_uuid))?;
        if !call.content_externalized {
            return Ok(call.content);
        }
        let uri = call
            .content_ref
            .ok_or_else(|| EngineError::Content(format!("call {call_uuid} is externalized without a reference")))?;
        let bytes = self.inner.blobs.fetch(&uri).await?;
        serde_json::from_slice(&bytes).map(Some).map_err(|e| EngineError::Content(e.to_string()))
    }

    /// Move a finished call's oversized inline content to the blob store.
    /// Returns whether anything moved.
    pub async fn externalize_call_content(&self, partition: &Partition, call_uuid: Uuid) -> Result<bool, EngineError> {
        let mut call =
            self.inner.entities.call(partition, call_uuid).await?.ok_or(EngineError::CallNotFound(call_uuid))?;
        if !call.status.is_terminal() || call.content_externalized {
            return Ok(false);
        }
        let Some(content) = &call.content else {
            return Ok(false);
        };
        let bytes = serde_json::to_vec(content).map_err(|e| EngineError::Content(e.to_string()))?;
        if bytes.len() <= self.inner.config.externalize_threshold_bytes {
            return Ok(false);
        }
        let uri = self.inner.blobs.put(&content_key(&call), bytes).await?;
        call.content = None;
        call.content_ref = Some(uri);
        call.content_externalized = true;
        call.updated_at = chrono::Utc::now();
        self.inner.entities.write_call(&call).await?;
        info!(partition = %partition, call_uuid = %call_uuid, "externalized call content");
        Ok(true)
    }

    /// Close the queue, let queued calls finish and wait for in-flight async
    /// units.
    pub async fn shutdown(&self) {
        let sender = self.queue.lock().unwrap_or_else(PoisonError::into_inner).take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if let Err(error) = worker.await {
                warn!(error = %error, "engine worker ended abnormally");
            }
        }
        match self.inner.async_slots.acquire_many(self.inner.async_capacity).await {
            Ok(permits) => permits.forget(),
            Err(error) => warn!(error = %error, "async slots closed during shutdown"),
        }
        self.inner.async_slots.close();
        info!("execution engine stopped");
    }
}

async fn worker_loop(worker: usize, inner: Arc<EngineInner>, queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            debug!(worker, "submission queue closed");
            break;
        };
        inner.process(job).await;
    }
}

// ── Execution ──────────────────────────────────────────────────────

impl EngineInner {
    async fn process(self: &Arc<Self>, job: Job) {
        let span = info_span!(
            "engine.call",
            partition = %job.call.partition,
            call_uuid = %job.call.call_uuid,
            name = %job.call.name
        );
        self.clone().run(job).instrument(span).await
    }

    async fn run(self: Arc<Self>, job: Job) {
        let Job { mut call, status, dedupe_key } = job;
        let started = Instant::now();

        if let Err(error) = self.recorder.transition(&mut call, CallStatus::InProcess, |_| {}).await {
            error!(error = %error, "failed to record in_process status");
        }
        status.send_replace(call.status);

        let resolved = match self.prepare(&call).await {
            Ok(resolved) => resolved,
            Err(failure) => {
                self.finish(call, status, dedupe_key, started, Err(failure)).await;
                return;
            }
        };

        if !resolved.function.is_async {
            let outcome = self.run_blocking(&call, &resolved).await;
            self.finish(call, status, dedupe_key, started, outcome).await;
            return;
        }

        let permit = match self.async_slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let outcome = Err(Failure::execution("engine shut down before the call started"));
                self.finish(call, status, dedupe_key, started, outcome).await;
                return;
            }
        };
        let inner = self.clone();
        tokio::spawn(
            async move {
                let outcome = inner.run_async(&call, &resolved).await;
                inner.finish(call, status, dedupe_key, started, outcome).await;
                drop(permit);
            }
            .in_current_span(),
        );
    }

    /// Resolve the unit and check the request against the function.
    async fn prepare(&self, call: &McpFunctionCall) -> Result<ResolvedUnit, Failure> {
        let resolved = self.registry.resolve(&call.partition, &call.name).await.map_err(Failure::resolution)?;
        let function = &resolved.function;
        if function.mcp_type != call.mcp_type {
            return Err(Failure::validation(format!(
                "`{}` is a {}, not a {}",
                function.name, function.mcp_type, call.mcp_type
            )));
        }
        shaping::validate_arguments(function, &call.arguments).map_err(Failure::validation)?;
        Ok(resolved)
    }

    fn context(&self, call: &McpFunctionCall, resolved: &ResolvedUnit) -> InvocationContext {
        let bus = self.bus.clone();
        let partition = call.partition.clone();
        let call_uuid = call.call_uuid;
        let name = call.name.clone();
        InvocationContext::new(call.partition.clone(), call.call_uuid, resolved.function.entry_point()).with_progress(
            Arc::new(move |progress| {
                bus.publish(&partition, EventPayload::CallProgress { call_uuid, name: name.clone(), progress });
            }),
        )
    }

    async fn run_blocking(&self, call: &McpFunctionCall, resolved: &ResolvedUnit) -> Result<Value, Failure> {
        let ctx = self.context(call, resolved);
        let cancel = ctx.cancel_signal();
        let unit = resolved.handle.unit();
        let arguments = shaping::unit_arguments(&resolved.function, &call.arguments);
        let task = tokio::task::spawn_blocking(move || unit.call(&ctx, &arguments));

        let limit = self.config.call_timeout();
        let output = match tokio::time::timeout(limit, task).await {
            Ok(Ok(Ok(output))) => output,
            Ok(Ok(Err(error))) => return Err(Failure::execution(error.to_string())),
            Ok(Err(join_error)) => return Err(Failure::execution(format!("unit panicked: {join_error}"))),
            Err(_) => {
                cancel.cancel();
                warn!(timeout_ms = limit.as_millis() as u64, "blocking unit timed out; abandoning it");
                return Err(Failure::timeout(limit));
            }
        };
        shaping::shape_result(&resolved.function, output).map_err(Failure::execution)
    }

    async fn run_async(&self, call: &McpFunctionCall, resolved: &ResolvedUnit) -> Result<Value, Failure> {
        let ctx = self.context(call, resolved);
        let cancel = ctx.cancel_signal();
        let unit = resolved.handle.unit();
        let arguments = shaping::unit_arguments(&resolved.function, &call.arguments);
        let mut task = tokio::spawn(async move { unit.call_async(ctx, arguments).await });

        let limit = self.config.call_timeout();
        let output = match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(Ok(output))) => output,
            Ok(Ok(Err(error))) => return Err(Failure::execution(error.to_string())),
            Ok(Err(join_error)) => return Err(Failure::execution(format!("unit panicked: {join_error}"))),
            Err(_) => {
                cancel.cancel();
                task.abort();
                warn!(timeout_ms = limit.as_millis() as u64, "async unit timed out; aborted");
                return Err(Failure::timeout(limit));
            }
        };
        shaping::shape_result(&resolved.function, output).map_err(Failure::execution)
    }

    async fn finish(
        &self,
        mut call: McpFunctionCall,
        status: watch::Sender<CallStatus>,
        dedupe_key: Option<String>,
        started: Instant,
        outcome: Result<Value, Failure>,
    ) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let outcome = match outcome {
            Ok(content) => self.store_content(&call, content).await,
            Err(failure) => Err(failure),
        };

        let recorded = match outcome {
            Ok(content) => {
                self.recorder
                    .transition(&mut call, CallStatus::Completed, |call| {
                        call.time_spent_ms = Some(elapsed_ms);
                        match content {
                            StoredContent::Inline(value) => call.content = Some(value),
                            StoredContent::External(uri) => {
                                call.content_ref = Some(uri);
                                call.content_externalized = true;
                            }
                        }
                    })
                    .await
            }
            Err(failure) => {
                warn!(kind = failure.kind.as_str(), error = %failure.message, "call failed");
                self.recorder
                    .transition(&mut call, CallStatus::Failed, |call| {
                        call.time_spent_ms = Some(elapsed_ms);
                        failure.record(call);
                    })
                    .await
            }
        };
        if let Err(error) = recorded {
            error!(error = %error, "failed to record terminal call status");
        }

        info!(status = %call.status, time_spent_ms = elapsed_ms, "call finished");
        self.release(&call.partition, dedupe_key.as_deref());
        status.send_replace(call.status);
    }

    async fn store_content(&self, call: &McpFunctionCall, content: Value) -> Result<StoredContent, Failure> {
        let bytes = serde_json::to_vec(&content).map_err(|e| Failure::execution(format!("unserializable result: {e}")))?;
        if bytes.len() <= self.config.externalize_threshold_bytes {
            return Ok(StoredContent::Inline(content));
        }
        let size = bytes.len();
        let uri = self
            .blobs
            .put(&content_key(call), bytes)
            .await
            .map_err(|e| Failure::execution(format!("failed to externalize result: {e}")))?;
        debug!(size, uri = %uri, "externalized call result");
        Ok(StoredContent::External(uri))
    }

    fn pending_call(&self, partition: &Partition, dedupe_key: Option<&str>) -> Option<CallHandle> {
        let key = dedupe_key?;
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = pending.get(&(partition.clone(), key.to_string()))?;
        info!(dedupe_key = %key, call_uuid = %existing.call_uuid, "request matches a pending call");
        Some(existing.duplicate())
    }

    fn release(&self, partition: &Partition, dedupe_key: Option<&str>) {
        if let Some(key) = dedupe_key {
            self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&(partition.clone(), key.to_string()));
        }
    }
}

/// Holds a dedupe key between reservation and enqueue. Dropped before
/// `commit` (store error, or the dispatch future was cancelled), it frees the
/// key.
struct DedupeReservation<'a> {
    inner: &'a EngineInner,
    partition: Partition,
    key: Option<String>,
}

impl DedupeReservation<'_> {
    fn commit(mut self) {
        self.key = None;
    }
}

impl Drop for DedupeReservation<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            debug!(dedupe_key = %key, "releasing dedupe key of an abandoned dispatch");
            self.inner.release(&self.partition, Some(&key));
        }
    }
}

fn content_key(call: &McpFunctionCall) -> String {
    format!("calls/{}/{}.json", call.partition, call.call_uuid)
}
