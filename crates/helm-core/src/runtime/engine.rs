use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::action::{Action, Orphan};
use super::actor::{RunCmd, RunHandle, plan_call, spawn_run_actor};
use super::state::RunState;
use crate::api::{ModelClient, RetryingClient};
use crate::bus::{EventBus, Subscription};
use crate::config::EngineConfig;
use crate::events::{EventCursor, EventLog, EventLogError, ResumeDecision, RunEvent};
use crate::retry::RetryPolicy;
use crate::session::{RunMeta, RunStatus, SessionAttributes, SessionStore, StoreError};
use crate::tools::ToolExecutor;
use crate::types::{AgentId, RunId, SessionId};
use helm_tools::ErrorKind;

const REPLAY_BATCH: usize = 256;
const SUPERVISOR_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error("Run already exists: {run_id}")]
    RunExists { run_id: String },

    #[error("Run {run_id} is {status} and cannot be resumed")]
    NotResumable { run_id: String, status: RunStatus },

    #[error("Invalid request for run {run_id}: {message}")]
    InvalidState { run_id: String, message: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Engine shutting down")]
    ShuttingDown,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Store(e) => e.kind(),
            EngineError::EventLog(e) => e.kind(),
            EngineError::RunExists { .. }
            | EngineError::NotResumable { .. }
            | EngineError::InvalidState { .. } => ErrorKind::Conflict,
            EngineError::ChannelClosed => ErrorKind::Permanent,
            EngineError::ShuttingDown => ErrorKind::Transient,
        }
    }
}

/// Everything a run needs, shared by the supervisor and every run mailbox.
///
/// [`RunEngine::spawn`] wraps `model` in a [`RetryingClient`] driven by
/// `model_retry`, so transient provider failures are retried at the call
/// site before they reach a run.
pub struct EngineDeps {
    pub store: Arc<dyn SessionStore>,
    pub log: Arc<dyn EventLog>,
    pub executor: ToolExecutor,
    pub model: Arc<dyn ModelClient>,
    pub bus: EventBus,
    pub config: EngineConfig,
    pub tool_retry: RetryPolicy,
    pub model_retry: RetryPolicy,
}

impl EngineDeps {
    pub fn new(
        store: Arc<dyn SessionStore>,
        log: Arc<dyn EventLog>,
        executor: ToolExecutor,
        model: Arc<dyn ModelClient>,
        bus: EventBus,
    ) -> Self {
        Self {
            store,
            log,
            executor,
            model,
            bus,
            config: EngineConfig::default(),
            tool_retry: RetryPolicy::default(),
            model_retry: RetryPolicy::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tool_retry(mut self, policy: RetryPolicy) -> Self {
        self.tool_retry = policy;
        self
    }

    pub fn with_model_retry(mut self, policy: RetryPolicy) -> Self {
        self.model_retry = policy;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub session_id: SessionId,
    pub agent_id: AgentId,
    pub message: String,
    /// Caller-chosen run id; generated when absent.
    pub run_id: Option<RunId>,
    /// Applied only when this submission creates the session.
    pub attributes: SessionAttributes,
    pub labels: BTreeMap<String, String>,
}

impl SubmitRequest {
    pub fn new(session_id: SessionId, agent_id: AgentId, message: impl Into<String>) -> Self {
        Self {
            session_id,
            agent_id,
            message: message.into(),
            run_id: None,
            attributes: SessionAttributes::default(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_attributes(mut self, attributes: SessionAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

pub(crate) enum SupervisorCmd {
    Submit {
        request: SubmitRequest,
        reply: oneshot::Sender<Result<RunId, EngineError>>,
    },
    Rehydrate {
        run_id: RunId,
        reply: oneshot::Sender<Result<RunStatus, EngineError>>,
    },
    Recover {
        reply: oneshot::Sender<Result<Vec<RunId>, EngineError>>,
    },
    Cancel {
        run_id: RunId,
        reason: Option<String>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Pause {
        run_id: RunId,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Resume {
        run_id: RunId,
        decision: ResumeDecision,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Status {
        run_id: RunId,
        reply: oneshot::Sender<Result<RunStatus, EngineError>>,
    },
    Wait {
        run_id: RunId,
        reply: oneshot::Sender<Result<watch::Receiver<Option<RunStatus>>, EngineError>>,
    },
    ListActive {
        reply: oneshot::Sender<Vec<RunId>>,
    },
    Shutdown {
        reply: oneshot::Sender<Vec<watch::Receiver<Option<RunStatus>>>>,
    },
}

/// Handle to the run supervisor. Cloning is cheap; every clone talks to the
/// same supervisor task.
#[derive(Clone)]
pub struct RunEngine {
    cmd_tx: mpsc::Sender<SupervisorCmd>,
    deps: Arc<EngineDeps>,
    owner: Arc<str>,
}

impl RunEngine {
    pub fn spawn(mut deps: EngineDeps) -> Self {
        deps.model = Arc::new(RetryingClient::new(deps.model.clone(), deps.model_retry));
        let deps = Arc::new(deps);
        let owner: Arc<str> = Arc::from(format!("helm-{}", uuid::Uuid::new_v4()));
        let (cmd_tx, cmd_rx) = mpsc::channel(SUPERVISOR_CHANNEL_CAPACITY);
        let supervisor = RunSupervisor::new(deps.clone(), owner.clone(), cmd_tx.downgrade());
        tokio::spawn(supervisor.run(cmd_rx));
        info!(target: "helm::engine", owner = %owner, "Run engine started");
        Self {
            cmd_tx,
            deps,
            owner,
        }
    }

    /// Lease owner identity of this engine.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.deps.store
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.deps.log
    }

    pub fn bus(&self) -> &EventBus {
        &self.deps.bus
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.deps.executor
    }

    async fn request<T>(
        &self,
        cmd: impl FnOnce(oneshot::Sender<T>) -> SupervisorCmd,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(cmd(reply_tx))
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Start a run for a user message. The session is created on first use;
    /// the returned run id is already logged and leased by this engine.
    pub async fn submit(&self, request: SubmitRequest) -> Result<RunId, EngineError> {
        self.request(|reply| SupervisorCmd::Submit { request, reply })
            .await?
    }

    /// Take over a `running` or `paused` run left by a previous owner.
    pub async fn rehydrate(&self, run_id: &RunId) -> Result<RunStatus, EngineError> {
        let run_id = run_id.clone();
        self.request(|reply| SupervisorCmd::Rehydrate { run_id, reply })
            .await?
    }

    /// Rehydrate every resumable run whose lease is free. Runs another owner
    /// still holds are skipped.
    pub async fn recover(&self) -> Result<Vec<RunId>, EngineError> {
        self.request(|reply| SupervisorCmd::Recover { reply })
            .await?
    }

    /// Idempotent: canceling a finished run succeeds without effect.
    pub async fn cancel(&self, run_id: &RunId, reason: Option<String>) -> Result<(), EngineError> {
        let run_id = run_id.clone();
        self.request(|reply| SupervisorCmd::Cancel {
            run_id,
            reason,
            reply,
        })
        .await?
    }

    pub async fn pause(&self, run_id: &RunId) -> Result<(), EngineError> {
        let run_id = run_id.clone();
        self.request(|reply| SupervisorCmd::Pause { run_id, reply })
            .await?
    }

    /// Continue a paused run. When the pause is a confirmation, `decision`
    /// answers it.
    pub async fn resume(&self, run_id: &RunId, decision: ResumeDecision) -> Result<(), EngineError> {
        let run_id = run_id.clone();
        self.request(|reply| SupervisorCmd::Resume {
            run_id,
            decision,
            reply,
        })
        .await?
    }

    pub async fn status(&self, run_id: &RunId) -> Result<RunStatus, EngineError> {
        let run_id = run_id.clone();
        self.request(|reply| SupervisorCmd::Status { run_id, reply })
            .await?
    }

    /// Wait until this engine stops hosting the run and return its status.
    /// Returns at once for runs hosted elsewhere or already finished.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunStatus, EngineError> {
        let run_id = run_id.clone();
        let mut done = self
            .request(|reply| SupervisorCmd::Wait { run_id, reply })
            .await??;
        let status = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        (*status).ok_or(EngineError::ChannelClosed)
    }

    pub async fn active_runs(&self) -> Result<Vec<RunId>, EngineError> {
        self.request(|reply| SupervisorCmd::ListActive { reply })
            .await
    }

    pub fn subscribe(
        &self,
        run_id: &RunId,
        from: Option<EventCursor>,
        cancel: CancellationToken,
    ) -> Subscription {
        self.deps.bus.subscribe(run_id, from, cancel)
    }

    /// Release every hosted run without ending it and wait for the mailboxes
    /// to drain.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let receivers = self
            .request(|reply| SupervisorCmd::Shutdown { reply })
            .await?;
        for mut done in receivers {
            let _ = done.wait_for(Option::is_some).await;
        }
        Ok(())
    }
}

/// A run whose store work is done, ready for a mailbox.
struct Ready {
    meta: RunMeta,
    state: RunState,
    initial: Action,
}

/// Result of store work done off the supervisor task.
enum Preparation {
    Host(Ready),
    /// The run is already over; nothing to host.
    Finished(RunStatus),
}

/// Sent back to the supervisor once a spawned preparation ends.
enum Prepared {
    Ready { ready: Ready, then: Then },
    /// Nothing was hosted. The requester has been answered; requests that
    /// queued behind the preparation are routed again.
    Dropped { run_id: RunId },
}

/// A request waiting for a run to be hosted.
enum Then {
    Submitted(oneshot::Sender<Result<RunId, EngineError>>),
    Rehydrated(oneshot::Sender<Result<RunStatus, EngineError>>),
    Forward(RunCmd),
    Wait(oneshot::Sender<Result<watch::Receiver<Option<RunStatus>>, EngineError>>),
}

impl Then {
    fn fail(self, error: EngineError) {
        match self {
            Then::Submitted(reply) => {
                let _ = reply.send(Err(error));
            }
            Then::Rehydrated(reply) => {
                let _ = reply.send(Err(error));
            }
            Then::Forward(cmd) => cmd.reject(match error {
                EngineError::NotResumable { run_id, status } => EngineError::InvalidState {
                    run_id,
                    message: format!("run is {status}"),
                },
                error => error,
            }),
            Then::Wait(reply) => {
                let _ = reply.send(Err(error));
            }
        }
    }

    fn finished(self, run_id: &RunId, status: RunStatus) {
        match self {
            Then::Rehydrated(reply) => {
                let _ = reply.send(Ok(status));
            }
            Then::Forward(RunCmd::Cancel { reply, .. }) => {
                let _ = reply.send(Ok(()));
            }
            Then::Wait(reply) => {
                let (_, done) = watch::channel(Some(status));
                let _ = reply.send(Ok(done));
            }
            then => then.fail(EngineError::InvalidState {
                run_id: run_id.to_string(),
                message: format!("run is {status}"),
            }),
        }
    }

    /// Answer from the mailbox hosting the run. `status` is known when the
    /// run was hosted for this request.
    fn settle(
        self,
        deps: &Arc<EngineDeps>,
        run_id: &RunId,
        handle: &RunHandle,
        status: Option<RunStatus>,
    ) {
        match self {
            Then::Submitted(reply) => {
                let _ = reply.send(Ok(run_id.clone()));
            }
            Then::Rehydrated(reply) => match status {
                Some(status) => {
                    let _ = reply.send(Ok(status));
                }
                None => {
                    let deps = deps.clone();
                    let handle = handle.clone();
                    let run_id = run_id.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(current_status(&deps, Some(&handle), &run_id).await);
                    });
                }
            },
            Then::Forward(cmd) => handle.forward(cmd),
            Then::Wait(reply) => {
                let _ = reply.send(Ok(handle.done()));
            }
        }
    }
}

/// Routes commands to run mailboxes. Store work is spawned so that a slow
/// store on one run never holds up requests for another.
struct RunSupervisor {
    deps: Arc<EngineDeps>,
    owner: Arc<str>,
    runs: HashMap<RunId, RunHandle>,
    /// Runs with store work in flight, and the requests queued behind it.
    preparing: HashMap<RunId, Vec<Then>>,
    engine: mpsc::WeakSender<SupervisorCmd>,
    exit_tx: mpsc::UnboundedSender<RunId>,
    exit_rx: mpsc::UnboundedReceiver<RunId>,
    prepared_tx: mpsc::UnboundedSender<Prepared>,
    prepared_rx: mpsc::UnboundedReceiver<Prepared>,
    shutting_down: bool,
}

impl RunSupervisor {
    fn new(
        deps: Arc<EngineDeps>,
        owner: Arc<str>,
        engine: mpsc::WeakSender<SupervisorCmd>,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (prepared_tx, prepared_rx) = mpsc::unbounded_channel();
        Self {
            deps,
            owner,
            runs: HashMap::new(),
            preparing: HashMap::new(),
            engine,
            exit_tx,
            exit_rx,
            prepared_tx,
            prepared_rx,
            shutting_down: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SupervisorCmd>) {
        loop {
            tokio::select! {
                biased;

                Some(run_id) = self.exit_rx.recv() => {
                    self.runs.remove(&run_id);
                    debug!(
                        target: "helm::engine",
                        run_id = %run_id,
                        active = self.runs.len(),
                        "Run released"
                    );
                }

                Some(prepared) = self.prepared_rx.recv() => self.on_prepared(prepared),

                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.dispatch(cmd),
                    None => break,
                },
            }
        }
        debug!(target: "helm::engine", "Run supervisor stopped");
    }

    fn dispatch(&mut self, cmd: SupervisorCmd) {
        match cmd {
            SupervisorCmd::Submit { request, reply } => self.submit(request, reply),
            SupervisorCmd::Rehydrate { run_id, reply } => {
                self.route(run_id, Then::Rehydrated(reply));
            }
            SupervisorCmd::Recover { reply } => self.recover(reply),
            SupervisorCmd::Cancel {
                run_id,
                reason,
                reply,
            } => self.cancel(run_id, reason, reply),
            SupervisorCmd::Pause { run_id, reply } => {
                self.route(run_id, Then::Forward(RunCmd::Pause { reply }));
            }
            SupervisorCmd::Resume {
                run_id,
                decision,
                reply,
            } => self.route(run_id, Then::Forward(RunCmd::Resume { decision, reply })),
            SupervisorCmd::Status { run_id, reply } => {
                let handle = self.runs.get(&run_id).cloned();
                let deps = self.deps.clone();
                tokio::spawn(async move {
                    let _ = reply.send(current_status(&deps, handle.as_ref(), &run_id).await);
                });
            }
            SupervisorCmd::Wait { run_id, reply } => self.wait(run_id, reply),
            SupervisorCmd::ListActive { reply } => {
                let _ = reply.send(self.runs.keys().cloned().collect());
            }
            SupervisorCmd::Shutdown { reply } => {
                self.shutting_down = true;
                let receivers = self
                    .runs
                    .values()
                    .map(|handle| {
                        handle.shutdown();
                        handle.done()
                    })
                    .collect();
                let _ = reply.send(receivers);
            }
        }
    }

    fn admit(&self) -> Result<(), EngineError> {
        if self.shutting_down {
            Err(EngineError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Run `work` on its own task. Requests for `run_id` queue until it
    /// reports back through `prepared_rx`.
    fn spawn_prepare<F>(&mut self, run_id: RunId, then: Then, work: F)
    where
        F: Future<Output = Result<Preparation, EngineError>> + Send + 'static,
    {
        self.preparing.insert(run_id.clone(), Vec::new());
        let prepared_tx = self.prepared_tx.clone();
        tokio::spawn(async move {
            let prepared = match work.await {
                Ok(Preparation::Host(ready)) => Prepared::Ready { ready, then },
                Ok(Preparation::Finished(status)) => {
                    then.finished(&run_id, status);
                    Prepared::Dropped { run_id }
                }
                Err(e) => {
                    then.fail(e);
                    Prepared::Dropped { run_id }
                }
            };
            let _ = prepared_tx.send(prepared);
        });
    }

    fn on_prepared(&mut self, prepared: Prepared) {
        match prepared {
            Prepared::Ready { ready, then } => {
                let run_id = ready.meta.run_id.clone();
                let status = ready.state.status;
                let waiting = self.preparing.remove(&run_id).unwrap_or_default();
                let handle = self.host(ready);
                then.settle(&self.deps, &run_id, &handle, Some(status));
                for then in waiting {
                    then.settle(&self.deps, &run_id, &handle, None);
                }
                if self.shutting_down {
                    // Prepared while shutting down; leave it to the next owner.
                    handle.shutdown();
                }
            }
            Prepared::Dropped { run_id } => {
                for then in self.preparing.remove(&run_id).unwrap_or_default() {
                    match then {
                        Then::Forward(RunCmd::Cancel { reason, reply }) => {
                            self.cancel(run_id.clone(), reason, reply);
                        }
                        Then::Wait(reply) => self.wait(run_id.clone(), reply),
                        then => self.route(run_id.clone(), then),
                    }
                }
            }
        }
    }

    fn host(&mut self, ready: Ready) -> RunHandle {
        let run_id = ready.meta.run_id.clone();
        let handle = spawn_run_actor(
            self.deps.clone(),
            ready.meta,
            ready.state,
            self.owner.to_string(),
            ready.initial,
            self.exit_tx.clone(),
        );
        self.runs.insert(run_id, handle.clone());
        handle
    }

    fn submit(
        &mut self,
        request: SubmitRequest,
        reply: oneshot::Sender<Result<RunId, EngineError>>,
    ) {
        if let Err(e) = self.admit() {
            let _ = reply.send(Err(e));
            return;
        }
        let run_id = request.run_id.clone().unwrap_or_else(RunId::generate);
        if self.runs.contains_key(&run_id) || self.preparing.contains_key(&run_id) {
            let _ = reply.send(Err(EngineError::RunExists {
                run_id: run_id.to_string(),
            }));
            return;
        }
        let work = prepare_submit(
            self.deps.clone(),
            self.owner.clone(),
            run_id.clone(),
            request,
        );
        self.spawn_prepare(run_id, Then::Submitted(reply), work);
    }

    /// Hand `then` to the mailbox hosting `run_id`, rehydrating a resumable
    /// run first when none does.
    fn route(&mut self, run_id: RunId, then: Then) {
        if let Some(handle) = self.runs.get(&run_id) {
            then.settle(&self.deps, &run_id, handle, None);
            return;
        }
        if let Some(waiting) = self.preparing.get_mut(&run_id) {
            waiting.push(then);
            return;
        }
        if let Err(e) = self.admit() {
            then.fail(e);
            return;
        }
        let work = prepare_rehydrate(self.deps.clone(), self.owner.clone(), run_id.clone());
        self.spawn_prepare(run_id, then, work);
    }

    fn recover(&self, reply: oneshot::Sender<Result<Vec<RunId>, EngineError>>) {
        if let Err(e) = self.admit() {
            let _ = reply.send(Err(e));
            return;
        }
        let skip: HashSet<RunId> = self
            .runs
            .keys()
            .chain(self.preparing.keys())
            .cloned()
            .collect();
        let deps = self.deps.clone();
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let _ = reply.send(recover_runs(&deps, &engine, &skip).await);
        });
    }

    fn cancel(
        &mut self,
        run_id: RunId,
        reason: Option<String>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    ) {
        if let Some(handle) = self.runs.get(&run_id) {
            let handle = handle.clone();
            let deps = self.deps.clone();
            let owner = self.owner.clone();
            tokio::spawn(async move {
                let result = match handle.cancel(reason.clone()).await {
                    // The mailbox stopped before it saw the request.
                    Err(EngineError::ChannelClosed) => {
                        cancel_unhosted(deps, owner, run_id, reason).await.map(|_| ())
                    }
                    other => other,
                };
                let _ = reply.send(result);
            });
            return;
        }
        if let Some(waiting) = self.preparing.get_mut(&run_id) {
            waiting.push(Then::Forward(RunCmd::Cancel { reason, reply }));
            return;
        }
        let work = cancel_unhosted(
            self.deps.clone(),
            self.owner.clone(),
            run_id.clone(),
            reason.clone(),
        );
        self.spawn_prepare(run_id, Then::Forward(RunCmd::Cancel { reason, reply }), work);
    }

    fn wait(
        &mut self,
        run_id: RunId,
        reply: oneshot::Sender<Result<watch::Receiver<Option<RunStatus>>, EngineError>>,
    ) {
        if let Some(handle) = self.runs.get(&run_id) {
            let _ = reply.send(Ok(handle.done()));
            return;
        }
        if let Some(waiting) = self.preparing.get_mut(&run_id) {
            waiting.push(Then::Wait(reply));
            return;
        }
        let deps = self.deps.clone();
        tokio::spawn(async move {
            let result = match deps.store.load_run(&run_id).await {
                Ok(meta) => {
                    let (_, done) = watch::channel(Some(meta.status));
                    Ok(done)
                }
                Err(e) => Err(e.into()),
            };
            let _ = reply.send(result);
        });
    }
}

/// Create the session on first use, record the run, take its lease and log
/// the user message.
async fn prepare_submit(
    deps: Arc<EngineDeps>,
    owner: Arc<str>,
    run_id: RunId,
    request: SubmitRequest,
) -> Result<Preparation, EngineError> {
    let now = Utc::now();
    let store = &deps.store;

    store
        .create_session(&request.session_id, now, request.attributes)
        .await?;

    match store.load_run(&run_id).await {
        Ok(_) => {
            return Err(EngineError::RunExists {
                run_id: run_id.to_string(),
            });
        }
        Err(StoreError::RunNotFound { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    let mut meta = RunMeta::new(run_id.clone(), request.agent_id, request.session_id, now);
    meta.labels = request.labels;
    let meta = store.upsert_run(&meta).await?;
    store
        .acquire_lease(&run_id, &owner, deps.config.lease_ttl(), now)
        .await?;

    let record = deps
        .log
        .append(
            &run_id,
            RunEvent::UserMessage {
                text: request.message,
            },
        )
        .await?;
    deps.bus.publish(&record);

    info!(
        target: "helm::engine",
        run_id = %run_id,
        session_id = %meta.session_id,
        agent_id = %meta.agent_id,
        "Run submitted"
    );
    let state = RunState::new(run_id, deps.config.max_steps);
    Ok(Preparation::Host(Ready {
        meta,
        state,
        initial: Action::Start,
    }))
}

/// Take the lease of a `running` or `paused` run and rebuild its state from
/// the log.
async fn prepare_rehydrate(
    deps: Arc<EngineDeps>,
    owner: Arc<str>,
    run_id: RunId,
) -> Result<Preparation, EngineError> {
    let store = &deps.store;
    let meta = store.load_run(&run_id).await?;
    if !meta.status.is_resumable() {
        return Err(EngineError::NotResumable {
            run_id: run_id.to_string(),
            status: meta.status,
        });
    }
    let now = Utc::now();
    store
        .acquire_lease(&run_id, &owner, deps.config.lease_ttl(), now)
        .await?;

    let mut state = RunState::new(run_id.clone(), deps.config.max_steps);
    let replayed = match replay(deps.log.as_ref(), &mut state).await {
        Ok(count) => count,
        Err(e) => {
            let _ = store.release_lease(&run_id, &owner).await;
            return Err(e.into());
        }
    };

    if state.is_terminal() {
        // The terminal event was logged but the status update was lost.
        let status = state.status;
        if let Err(e) = store.upsert_run(&meta.with_status(status, now)).await {
            warn!(
                target: "helm::engine",
                run_id = %run_id,
                error = %e,
                "Failed to repair run status"
            );
        }
        let _ = store.release_lease(&run_id, &owner).await;
        return Ok(Preparation::Finished(status));
    }

    let catalog = deps.executor.catalog();
    let mut orphans = Vec::new();
    let mut awaiting = Vec::new();
    for call in state.unresolved() {
        let approved = state.approved.contains(&call.call_id);
        let mut planned = plan_call(catalog, call.call_id, call.tool_name, call.payload);
        if planned.confirmation.is_some() && !approved {
            awaiting.push(planned);
            continue;
        }
        planned.confirmation = None;
        let idempotent = catalog
            .lookup(&planned.tool_name)
            .is_ok_and(|entry| entry.definition.policy.idempotent);
        orphans.push(Orphan {
            call: planned,
            idempotent,
        });
    }
    state.in_flight.clear();
    let confirming = state
        .confirming
        .take()
        .map(|call| plan_call(catalog, call.call_id, call.tool_name, call.payload));

    info!(
        target: "helm::engine",
        run_id = %run_id,
        events = replayed,
        orphans = orphans.len(),
        status = %state.status,
        "Rehydrating run"
    );
    Ok(Preparation::Host(Ready {
        meta,
        state,
        initial: Action::Rehydrated {
            orphans,
            awaiting,
            confirming,
        },
    }))
}

async fn replay(log: &dyn EventLog, state: &mut RunState) -> Result<usize, EventLogError> {
    let mut cursor = None;
    let mut count = 0;
    loop {
        let page = log.scan(&state.run_id, cursor, REPLAY_BATCH).await?;
        for record in &page.events {
            state.apply_event(&record.event);
        }
        count += page.events.len();
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(count),
        }
    }
}

/// Rehydrate every resumable run not in `skip`, one at a time, through the
/// supervisor so each is routed like any other request.
async fn recover_runs(
    deps: &EngineDeps,
    engine: &mpsc::WeakSender<SupervisorCmd>,
    skip: &HashSet<RunId>,
) -> Result<Vec<RunId>, EngineError> {
    let candidates = deps
        .store
        .list_runs_by_status(&[RunStatus::Running, RunStatus::Paused])
        .await?;
    let mut recovered = Vec::new();
    for meta in candidates {
        if skip.contains(&meta.run_id) {
            continue;
        }
        let cmd_tx = engine.upgrade().ok_or(EngineError::ShuttingDown)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx
            .send(SupervisorCmd::Rehydrate {
                run_id: meta.run_id.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        drop(cmd_tx);
        match reply_rx.await.map_err(|_| EngineError::ChannelClosed)? {
            Ok(_) => recovered.push(meta.run_id),
            Err(e) => warn!(
                target: "helm::engine",
                run_id = %meta.run_id,
                error = %e,
                "Skipping run during recovery"
            ),
        }
    }
    Ok(recovered)
}

/// Cancel a run no mailbox of this engine hosts, e.g. one left `pending`
/// or `paused` by a stopped process.
async fn cancel_unhosted(
    deps: Arc<EngineDeps>,
    owner: Arc<str>,
    run_id: RunId,
    reason: Option<String>,
) -> Result<Preparation, EngineError> {
    let store = &deps.store;
    let meta = store.load_run(&run_id).await?;
    if meta.status.is_terminal() {
        return Ok(Preparation::Finished(meta.status));
    }
    let now = Utc::now();
    store
        .acquire_lease(&run_id, &owner, deps.config.lease_ttl(), now)
        .await?;

    let result = async {
        match deps
            .log
            .append(&run_id, RunEvent::terminal(RunStatus::Canceled, reason))
            .await
        {
            Ok(record) => deps.bus.publish(&record),
            Err(EventLogError::RunTerminated { .. }) => {}
            Err(e) => return Err(EngineError::from(e)),
        }
        match store
            .upsert_run(&meta.with_status(RunStatus::Canceled, now))
            .await
        {
            Ok(_) | Err(StoreError::RunTerminal { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
    .await;

    if let Err(e) = store.release_lease(&run_id, &owner).await {
        warn!(
            target: "helm::engine",
            run_id = %run_id,
            error = %e,
            "Failed to release lease"
        );
    }
    result?;
    info!(target: "helm::engine", run_id = %run_id, "Canceled unhosted run");
    Ok(Preparation::Finished(RunStatus::Canceled))
}

/// Status from the hosting mailbox, or from the store once no mailbox
/// answers.
async fn current_status(
    deps: &EngineDeps,
    handle: Option<&RunHandle>,
    run_id: &RunId,
) -> Result<RunStatus, EngineError> {
    if let Some(handle) = handle {
        match handle.status().await {
            Err(EngineError::ChannelClosed) => {}
            other => return other,
        }
    }
    Ok(deps.store.load_run(run_id).await?.status)
}
