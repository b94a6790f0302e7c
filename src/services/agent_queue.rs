//! Per-agent execution queue.
//!
//! Each agent gets a worker with a single in-flight slot. Queued tasks are
//! ordered by priority band (high > normal > low); inside a band, executions
//! take turns (round-robin by execution id) so one process cannot starve
//! others sharing an agent, and FIFO order breaks remaining ties. Depth is
//! counted as running + queued; the overflow policy decides what happens
//! beyond it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::models::QueuePriority;
use crate::domain::ports::{AgentGateway, AgentTaskRequest, AgentTaskResult};

/// What to do when the queue is at depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Accept anyway; depth becomes advisory.
    Queue,
    /// Reject immediately with `QueueFull`.
    Reject,
    /// Wait up to `queue_timeout` for a slot, then reject.
    Delay,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Reject => "reject",
            Self::Delay => "delay",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queue" => Some(Self::Queue),
            "reject" => Some(Self::Reject),
            "delay" => Some(Self::Delay),
            _ => None,
        }
    }
}

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum running + queued tasks per agent.
    pub depth: usize,
    pub overflow: OverflowPolicy,
    /// Wait budget under the `Delay` policy.
    pub queue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth: 16,
            overflow: OverflowPolicy::Queue,
            queue_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle to a submitted task.
pub struct TaskHandle {
    pub id: Uuid,
    pub agent: String,
    result_rx: oneshot::Receiver<EngineResult<AgentTaskResult>>,
}

impl TaskHandle {
    /// Await the task's outcome.
    pub async fn result(self) -> EngineResult<AgentTaskResult> {
        self.result_rx
            .await
            .unwrap_or_else(|_| Err(EngineError::Internal("queue worker dropped task".into())))
    }
}

/// Snapshot of an agent's queue for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub running: Option<(Uuid, String)>,
    pub queued: usize,
}

struct QueuedTask {
    handle_id: Uuid,
    execution_id: Uuid,
    step_id: String,
    priority: QueuePriority,
    request: AgentTaskRequest,
    enqueued_seq: u64,
    result_tx: oneshot::Sender<EngineResult<AgentTaskResult>>,
    /// Execution-level cancel signal from the engine.
    cancel_rx: watch::Receiver<bool>,
    /// Handle-level cancel signal.
    task_cancel_tx: watch::Sender<bool>,
    task_cancel_rx: watch::Receiver<bool>,
}

struct RunningTask {
    handle_id: Uuid,
    execution_id: Uuid,
    step_id: String,
    task_cancel_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct WorkerState {
    queued: Vec<QueuedTask>,
    running: Option<RunningTask>,
    enqueue_seq: u64,
    /// Last-served tick per execution, for intra-band round-robin.
    served: HashMap<Uuid, u64>,
    served_tick: u64,
}

struct AgentWorker {
    agent: String,
    state: Mutex<WorkerState>,
    /// Wakes the worker loop when work arrives.
    work: Notify,
    /// Wakes `Delay`-policy submitters when a slot frees up.
    capacity: Notify,
}

impl AgentWorker {
    fn new(agent: String) -> Self {
        Self {
            agent,
            state: Mutex::new(WorkerState::default()),
            work: Notify::new(),
            capacity: Notify::new(),
        }
    }

    /// Pick the next task: highest band first, then the execution served
    /// longest ago, then FIFO.
    fn pick_next(state: &mut WorkerState) -> Option<QueuedTask> {
        let top = state.queued.iter().map(|t| t.priority).max()?;
        let pick_idx = state
            .queued
            .iter()
            .enumerate()
            .filter(|(_, t)| t.priority == top)
            .min_by_key(|(_, t)| {
                (
                    state.served.get(&t.execution_id).copied().unwrap_or(0),
                    t.enqueued_seq,
                )
            })
            .map(|(i, _)| i)?;
        let task = state.queued.remove(pick_idx);
        state.served_tick += 1;
        state.served.insert(task.execution_id, state.served_tick);
        Some(task)
    }

    async fn run(self: Arc<Self>, gateway: Arc<dyn AgentGateway>) {
        loop {
            let task = {
                let mut state = self.state.lock().await;
                match Self::pick_next(&mut state) {
                    Some(task) => {
                        state.running = Some(RunningTask {
                            handle_id: task.handle_id,
                            execution_id: task.execution_id,
                            step_id: task.step_id.clone(),
                            task_cancel_tx: task.task_cancel_tx.clone(),
                        });
                        Some(task)
                    }
                    None => None,
                }
            };

            let Some(task) = task else {
                self.work.notified().await;
                continue;
            };

            debug!(agent = %self.agent, step = %task.step_id, "dispatching agent task");
            let result = Self::execute(gateway.as_ref(), &task).await;
            let _ = task.result_tx.send(result);

            let mut state = self.state.lock().await;
            state.running = None;
            drop(state);
            self.capacity.notify_waiters();
        }
    }

    async fn execute(
        gateway: &dyn AgentGateway,
        task: &QueuedTask,
    ) -> EngineResult<AgentTaskResult> {
        if *task.cancel_rx.borrow() || *task.task_cancel_rx.borrow() {
            return Err(EngineError::Cancelled("task cancelled before dispatch".into()));
        }

        let timeout = task.request.timeout;
        tokio::select! {
            result = gateway.execute(task.request.clone(), task.cancel_rx.clone()) => result,
            () = Self::cancelled(task.cancel_rx.clone()) => {
                Err(EngineError::Cancelled("execution cancelled".into()))
            }
            () = Self::cancelled(task.task_cancel_rx.clone()) => {
                Err(EngineError::Cancelled("task cancelled".into()))
            }
            () = tokio::time::sleep(timeout) => {
                Err(EngineError::Timeout(format!(
                    "agent call exceeded {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    async fn cancelled(mut rx: watch::Receiver<bool>) {
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone; cancellation can never fire.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Registry of per-agent workers with the single-in-flight guarantee.
pub struct AgentExecutionQueue {
    gateway: Arc<dyn AgentGateway>,
    config: QueueConfig,
    workers: Mutex<HashMap<String, Arc<AgentWorker>>>,
}

impl AgentExecutionQueue {
    pub fn new(gateway: Arc<dyn AgentGateway>, config: QueueConfig) -> Self {
        Self { gateway, config, workers: Mutex::new(HashMap::new()) }
    }

    pub fn gateway(&self) -> &dyn AgentGateway {
        self.gateway.as_ref()
    }

    async fn worker(&self, agent: &str) -> Arc<AgentWorker> {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get(agent) {
            return worker.clone();
        }
        let worker = Arc::new(AgentWorker::new(agent.to_string()));
        workers.insert(agent.to_string(), worker.clone());
        tokio::spawn(worker.clone().run(self.gateway.clone()));
        worker
    }

    /// Submit a task for an agent. Returns a handle, or `QueueFull` per the
    /// overflow policy.
    pub async fn submit(
        &self,
        request: AgentTaskRequest,
        priority: QueuePriority,
        cancel_rx: watch::Receiver<bool>,
    ) -> EngineResult<TaskHandle> {
        let worker = self.worker(&request.agent).await;
        let handle_id = Uuid::new_v4();
        let (result_tx, result_rx) = oneshot::channel();
        let (task_cancel_tx, task_cancel_rx) = watch::channel(false);

        let deadline = tokio::time::Instant::now() + self.config.queue_timeout;
        loop {
            {
                let mut state = worker.state.lock().await;
                let in_use = state.queued.len() + usize::from(state.running.is_some());
                if in_use < self.config.depth || self.config.overflow == OverflowPolicy::Queue {
                    if in_use >= self.config.depth {
                        warn!(
                            agent = %request.agent,
                            depth = self.config.depth,
                            queued = state.queued.len(),
                            "agent queue past configured depth, queueing anyway"
                        );
                    }
                    state.enqueue_seq += 1;
                    let enqueued_seq = state.enqueue_seq;
                    state.queued.push(QueuedTask {
                        handle_id,
                        execution_id: request.execution_id,
                        step_id: request.step_id.clone(),
                        priority,
                        request: request.clone(),
                        enqueued_seq,
                        result_tx,
                        cancel_rx,
                        task_cancel_tx,
                        task_cancel_rx,
                    });
                    drop(state);
                    worker.work.notify_one();
                    debug!(agent = %request.agent, handle = %handle_id, "task queued");
                    return Ok(TaskHandle { id: handle_id, agent: request.agent, result_rx });
                }
            }

            match self.config.overflow {
                OverflowPolicy::Reject => {
                    return Err(EngineError::QueueFull { agent: request.agent });
                }
                OverflowPolicy::Delay => {
                    let wait = worker.capacity.notified();
                    if tokio::time::timeout_at(deadline, wait).await.is_err() {
                        return Err(EngineError::QueueFull { agent: request.agent });
                    }
                }
                OverflowPolicy::Queue => unreachable!("queue policy accepts above"),
            }
        }
    }

    /// Cancel a task by handle. In-queue tasks are discarded; an in-flight
    /// task is signalled and its cancellation is best-effort.
    pub async fn cancel(&self, agent: &str, handle_id: Uuid) -> bool {
        let worker = {
            let workers = self.workers.lock().await;
            match workers.get(agent) {
                Some(w) => w.clone(),
                None => return false,
            }
        };
        let mut state = worker.state.lock().await;
        if let Some(pos) = state.queued.iter().position(|t| t.handle_id == handle_id) {
            let task = state.queued.remove(pos);
            let _ = task
                .result_tx
                .send(Err(EngineError::Cancelled("task cancelled in queue".into())));
            return true;
        }
        if let Some(running) = &state.running {
            if running.handle_id == handle_id {
                let _ = running.task_cancel_tx.send(true);
                return true;
            }
        }
        false
    }

    /// Queue snapshot for an agent.
    pub async fn stats(&self, agent: &str) -> QueueStats {
        let workers = self.workers.lock().await;
        match workers.get(agent) {
            Some(worker) => {
                let state = worker.state.lock().await;
                QueueStats {
                    running: state
                        .running
                        .as_ref()
                        .map(|r| (r.execution_id, r.step_id.clone())),
                    queued: state.queued.len(),
                }
            }
            None => QueueStats { running: None, queued: 0 },
        }
    }

    /// Zero-based position of a queued task, by dispatch order within its
    /// priority band.
    pub async fn position(&self, agent: &str, handle_id: Uuid) -> Option<usize> {
        let workers = self.workers.lock().await;
        let worker = workers.get(agent)?;
        let state = worker.state.lock().await;
        let task = state.queued.iter().find(|t| t.handle_id == handle_id)?;
        let ahead = state
            .queued
            .iter()
            .filter(|t| {
                t.priority > task.priority
                    || (t.priority == task.priority && t.enqueued_seq < task.enqueued_seq)
            })
            .count();
        Some(ahead)
    }
}
