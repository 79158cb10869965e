use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::action::{Action, ConfirmationRequest, PlannedCall, ToolOutcome};
use super::effect::Effect;
use super::engine::{EngineDeps, EngineError};
use super::history::build_history;
use super::reduce::{ReduceError, reduce};
use super::state::RunState;
use crate::api::{ApiError, GenerateContext, GenerateResult, ToolChoice, ToolNameMap, ToolSpec};
use crate::events::ResumeDecision;
use crate::retry::RetryOutcome;
use crate::session::{RunMeta, RunStatus, StoreError};
use crate::tools::{InvocationContext, ToolCatalog};
use crate::types::{CallId, RunId};
use helm_tools::{ErrorKind, ToolDefinition, ToolError};

const ACTION_CHANNEL_CAPACITY: usize = 64;
const CMD_CHANNEL_CAPACITY: usize = 32;

pub(crate) enum RunCmd {
    Pause {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Resume {
        decision: ResumeDecision,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Cancel {
        reason: Option<String>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Status {
        reply: oneshot::Sender<RunStatus>,
    },
    /// Stop hosting the run without ending it; a later owner rehydrates it.
    Shutdown,
}

impl RunCmd {
    /// Answer the request without a mailbox.
    pub fn reject(self, error: EngineError) {
        match self {
            RunCmd::Pause { reply }
            | RunCmd::Resume { reply, .. }
            | RunCmd::Cancel { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            RunCmd::Status { .. } | RunCmd::Shutdown => {}
        }
    }
}

#[derive(Clone)]
pub(crate) struct RunHandle {
    cmd_tx: mpsc::Sender<RunCmd>,
    done_rx: watch::Receiver<Option<RunStatus>>,
}

impl RunHandle {
    /// Queue `cmd` without waiting on the mailbox; the reply goes straight
    /// to whoever holds the command's reply sender. A stopped mailbox drops
    /// the command, which the requester sees as a closed channel.
    pub fn forward(&self, cmd: RunCmd) {
        match self.cmd_tx.try_send(cmd) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let _ = cmd_tx.send(cmd).await;
                });
            }
        }
    }

    pub async fn cancel(&self, reason: Option<String>) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RunCmd::Cancel {
                reason,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<RunStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RunCmd::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.try_send(RunCmd::Shutdown);
    }

    /// Resolves with the final status once the mailbox has stopped.
    pub fn done(&self) -> watch::Receiver<Option<RunStatus>> {
        self.done_rx.clone()
    }
}

/// Actions whose effects can move a run into `running`.
fn may_enter_running(action: &Action) -> bool {
    matches!(
        action,
        Action::Start | Action::Rehydrated { .. } | Action::ResumeRequested { .. }
    )
}

/// Resolve a model-requested tool against the catalog: its execution policy
/// and, for tools that ask first, the rendered confirmation texts. Unknown
/// tools are planned as-is and fail at dispatch.
pub(crate) fn plan_call(
    catalog: &ToolCatalog,
    call_id: CallId,
    tool_name: String,
    payload: Value,
) -> PlannedCall {
    let mut call = PlannedCall::new(call_id, tool_name, payload);
    let Ok(entry) = catalog.lookup(&call.tool_name) else {
        return call;
    };
    call.serial = entry.definition.policy.serial;
    if let Some(policy) = &entry.definition.confirmation {
        call.confirmation = Some(ConfirmationRequest {
            title: policy.title.clone(),
            prompt: policy
                .render_prompt(&call.payload)
                .unwrap_or_else(|_| policy.prompt_template.clone()),
            denied_result: policy
                .render_denied(&call.payload)
                .unwrap_or_else(|_| policy.denied_result_template.clone()),
        });
    }
    call
}

pub(crate) fn spawn_run_actor(
    deps: Arc<EngineDeps>,
    meta: RunMeta,
    state: RunState,
    owner: String,
    initial: Action,
    exit_tx: mpsc::UnboundedSender<RunId>,
) -> RunHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
    let (done_tx, done_rx) = watch::channel(None);
    let actor = RunActor::new(deps, meta, state, owner);
    tokio::spawn(async move {
        let run_id = actor.state.run_id.clone();
        let status = actor.run(cmd_rx, initial).await;
        done_tx.send_replace(Some(status));
        let _ = exit_tx.send(run_id);
    });
    RunHandle { cmd_tx, done_rx }
}

struct RunActor {
    state: RunState,
    meta: RunMeta,
    owner: String,
    deps: Arc<EngineDeps>,
    /// Parent of every model call and tool invocation of this run.
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    action_tx: mpsc::Sender<Action>,
    action_rx: mpsc::Receiver<Action>,
    serial_locks: HashMap<String, Arc<Mutex<()>>>,
    permits: Arc<Semaphore>,
    finished: bool,
    /// Another owner took the lease; leave the run to it.
    lease_lost: bool,
}

impl RunActor {
    fn new(deps: Arc<EngineDeps>, meta: RunMeta, state: RunState, owner: String) -> Self {
        let (action_tx, action_rx) = mpsc::channel(ACTION_CHANNEL_CAPACITY);
        let permits = Arc::new(Semaphore::new(deps.config.max_concurrent_tools.max(1)));
        Self {
            state,
            meta,
            owner,
            deps,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            action_tx,
            action_rx,
            serial_locks: HashMap::new(),
            permits,
            finished: false,
            lease_lost: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RunCmd>, initial: Action) -> RunStatus {
        if let Err(e) = self.handle_action(initial).await {
            error!(
                target: "helm::engine",
                run_id = %self.state.run_id,
                error = %e,
                "Failed to start run"
            );
            self.finished = true;
        }

        let mut renew = tokio::time::interval(self.deps.config.lease_renewal_interval());
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.reset();

        while !self.finished {
            tokio::select! {
                biased;

                Some(cmd) = cmd_rx.recv() => self.handle_cmd(cmd).await,

                Some(action) = self.action_rx.recv() => {
                    if let Err(e) = self.handle_action(action).await {
                        error!(
                            target: "helm::engine",
                            run_id = %self.state.run_id,
                            error = %e,
                            "Failed to handle internal action"
                        );
                    }
                }

                _ = renew.tick() => self.renew_lease().await,

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        error!(
                            target: "helm::engine",
                            run_id = %self.state.run_id,
                            "Run task panicked"
                        );
                    }
                }

                else => break,
            }
        }

        // Requests queued behind the finish see a closed mailbox.
        cmd_rx.close();
        while cmd_rx.try_recv().is_ok() {}

        self.drain().await;
        if !self.lease_lost
            && let Err(e) = self
                .deps
                .store
                .release_lease(&self.state.run_id, &self.owner)
                .await
        {
            warn!(
                target: "helm::engine",
                run_id = %self.state.run_id,
                error = %e,
                "Failed to release lease"
            );
        }
        debug!(
            target: "helm::engine",
            run_id = %self.state.run_id,
            status = %self.state.status,
            "Run actor stopped"
        );
        self.state.status
    }

    async fn handle_cmd(&mut self, cmd: RunCmd) {
        match cmd {
            RunCmd::Pause { reply } => {
                let result = self.handle_action(Action::PauseRequested).await;
                let _ = reply.send(result);
            }
            RunCmd::Resume { decision, reply } => {
                let result = self
                    .handle_action(Action::ResumeRequested { decision })
                    .await;
                let _ = reply.send(result);
            }
            RunCmd::Cancel { reason, reply } => {
                let result = self.handle_action(Action::CancelRequested { reason }).await;
                let _ = reply.send(result);
            }
            RunCmd::Status { reply } => {
                let _ = reply.send(self.state.status);
            }
            RunCmd::Shutdown => {
                info!(
                    target: "helm::engine",
                    run_id = %self.state.run_id,
                    "Releasing run on shutdown"
                );
                self.cancel.cancel();
                self.finished = true;
            }
        }
    }

    async fn handle_action(&mut self, action: Action) -> Result<(), EngineError> {
        if matches!(action, Action::ResumeRequested { .. })
            && self.state.status == RunStatus::Paused
        {
            self.check_session().await?;
        }
        let before = may_enter_running(&action).then(|| self.state.clone());
        let effects = reduce(&mut self.state, action).map_err(|err| match err {
            ReduceError::InvalidAction { message, .. } => EngineError::InvalidState {
                run_id: self.state.run_id.to_string(),
                message,
            },
        })?;

        // Entering `running` is persisted before anything is logged, so a
        // store refusal leaves both the log and the run as they were.
        let entering = Effect::SetStatus(RunStatus::Running);
        let persisted = match before {
            Some(before) if effects.contains(&entering) => {
                if let Err(e) = self.persist_status(RunStatus::Running).await {
                    warn!(
                        target: "helm::engine",
                        run_id = %self.state.run_id,
                        error = %e,
                        "Store refused the move into running"
                    );
                    self.state = before;
                    return Err(e.into());
                }
                true
            }
            _ => false,
        };

        for effect in effects {
            if persisted && effect == entering {
                continue;
            }
            self.handle_effect(effect).await?;
        }
        Ok(())
    }

    /// Fails with `SessionEnded` once the run's session has ended.
    async fn check_session(&self) -> Result<(), EngineError> {
        let session = self.deps.store.load_session(&self.meta.session_id).await?;
        if session.is_active() {
            Ok(())
        } else {
            Err(StoreError::SessionEnded {
                session_id: self.meta.session_id.to_string(),
            }
            .into())
        }
    }

    async fn persist_status(&mut self, status: RunStatus) -> Result<(), StoreError> {
        let meta = self.meta.clone().with_status(status, Utc::now());
        self.meta = self.deps.store.upsert_run(&meta).await?;
        Ok(())
    }

    async fn handle_effect(&mut self, effect: Effect) -> Result<(), EngineError> {
        match effect {
            Effect::Append(event) => {
                let record = match self.deps.log.append(&self.state.run_id, event).await {
                    Ok(record) => record,
                    Err(e) => {
                        error!(
                            target: "helm::events",
                            run_id = %self.state.run_id,
                            error = %e,
                            "Failed to append run event"
                        );
                        // The log is the source of truth; stop and leave the
                        // run for rehydration.
                        self.cancel.cancel();
                        self.finished = true;
                        return Err(EngineError::EventLog(e));
                    }
                };
                self.deps.bus.publish(&record);
            }
            Effect::SetStatus(status) => {
                if let Err(e) = self.persist_status(status).await {
                    warn!(
                        target: "helm::engine",
                        run_id = %self.state.run_id,
                        status = %status,
                        error = %e,
                        "Failed to persist run status"
                    );
                }
            }
            Effect::CallModel { step } => self.spawn_model_call(step),
            Effect::DispatchTool(call) => self.spawn_tool_call(call),
            Effect::CancelInFlight => self.cancel.cancel(),
            Effect::Finish => self.finished = true,
        }
        Ok(())
    }

    fn spawn_model_call(&mut self, step: u32) {
        let deps = self.deps.clone();
        let action_tx = self.action_tx.clone();
        let run_id = self.state.run_id.clone();
        let cancel = self.cancel.child_token();
        self.tasks.spawn(async move {
            let action = call_model(&deps, &run_id, step, &cancel, &action_tx).await;
            let _ = action_tx.send(action).await;
        });
    }

    fn spawn_tool_call(&mut self, call: PlannedCall) {
        let deps = self.deps.clone();
        let action_tx = self.action_tx.clone();
        let run_id = self.state.run_id.clone();
        let cancel = self.cancel.child_token();
        let permits = self.permits.clone();
        let serial = call.serial.then(|| {
            self.serial_locks
                .entry(call.tool_name.clone())
                .or_default()
                .clone()
        });
        self.tasks.spawn(async move {
            let outcome = run_tool(&deps, &run_id, &call, permits, serial, &cancel).await;
            let _ = action_tx
                .send(Action::ToolFinished {
                    call_id: call.call_id,
                    tool_name: call.tool_name,
                    outcome,
                })
                .await;
        });
    }

    async fn renew_lease(&mut self) {
        let result = self
            .deps
            .store
            .renew_lease(
                &self.state.run_id,
                &self.owner,
                self.deps.config.lease_ttl(),
                Utc::now(),
            )
            .await;
        match result {
            Ok(_) => {}
            Err(StoreError::LeaseHeld { owner, .. }) => {
                warn!(
                    target: "helm::engine",
                    run_id = %self.state.run_id,
                    new_owner = %owner,
                    "Lease lost, abandoning run"
                );
                self.lease_lost = true;
                self.cancel.cancel();
                self.finished = true;
            }
            Err(e) => {
                warn!(
                    target: "helm::engine",
                    run_id = %self.state.run_id,
                    error = %e,
                    "Failed to renew lease"
                );
            }
        }
    }

    /// Let in-flight work wind down within the drain window, discarding
    /// whatever it reports, then abort the rest.
    async fn drain(&mut self) {
        let deadline = Instant::now() + self.deps.config.drain_window();
        loop {
            tokio::select! {
                biased;

                Some(_) = self.action_rx.recv() => {}

                joined = self.tasks.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }

                () = tokio::time::sleep_until(deadline) => {
                    warn!(
                        target: "helm::engine",
                        run_id = %self.state.run_id,
                        remaining = self.tasks.len(),
                        "Drain window elapsed, aborting run tasks"
                    );
                    self.tasks.abort_all();
                    break;
                }
            }
        }
    }
}

async fn call_model(
    deps: &EngineDeps,
    run_id: &RunId,
    step: u32,
    cancel: &CancellationToken,
    action_tx: &mpsc::Sender<Action>,
) -> Action {
    let failed = |kind: ErrorKind, message: String| Action::ModelFailed {
        step,
        kind,
        message,
    };
    let canceled = || failed(ErrorKind::Canceled, "model call canceled".to_string());
    // A provider can report a cancellation of its own. Only this run's token
    // makes it a cancellation of the run; otherwise the step has failed.
    let provider_failed = |error: ApiError| {
        let kind = match error.kind() {
            ErrorKind::Canceled if !cancel.is_cancelled() => ErrorKind::Permanent,
            kind => kind,
        };
        failed(kind, error.to_string())
    };

    let records = match deps.log.recent(run_id, deps.config.history_window).await {
        Ok(records) => records,
        Err(e) => return failed(e.kind(), format!("Failed to load history: {e}")),
    };
    let definitions = deps.executor.catalog().list();
    let names = ToolNameMap::new(definitions.iter().map(ToolDefinition::qualified_name));
    let specs: Vec<ToolSpec> = definitions
        .iter()
        .filter_map(|definition| ToolSpec::from_definition(definition, &names))
        .collect();
    let history = build_history(&records, &names);

    debug!(
        target: "helm::api",
        run_id = %run_id,
        step,
        messages = history.len(),
        tools = specs.len(),
        provider = deps.model.name(),
        "Calling model"
    );
    let ctx = GenerateContext::new(run_id.clone(), cancel.clone());
    let result = tokio::select! {
        biased;
        () = cancel.cancelled() => return canceled(),
        result = deps.model.generate(&ctx, &history, &specs, ToolChoice::Auto) => result,
    };

    match result {
        Err(e) => provider_failed(e),
        Ok(GenerateResult::Stop(reason)) => Action::ModelStopped { step, reason },
        Ok(GenerateResult::ToolCalls(requests)) => {
            let catalog = deps.executor.catalog();
            let calls = requests
                .into_iter()
                .map(|request| {
                    let tool_name = names
                        .canonical(&request.tool_name)
                        .map_or(request.tool_name, str::to_string);
                    plan_call(catalog, request.call_id, tool_name, request.payload)
                })
                .collect();
            Action::ModelToolCalls { step, calls }
        }
        Ok(GenerateResult::Text(mut stream)) => loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return canceled(),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(text)) => {
                    if action_tx
                        .send(Action::ModelChunk { step, text })
                        .await
                        .is_err()
                    {
                        return canceled();
                    }
                }
                Some(Err(e)) => return provider_failed(e),
                None => return Action::ModelFinished { step },
            }
        },
    }
}

async fn run_tool(
    deps: &EngineDeps,
    run_id: &RunId,
    call: &PlannedCall,
    permits: Arc<Semaphore>,
    serial: Option<Arc<Mutex<()>>>,
    cancel: &CancellationToken,
) -> ToolOutcome {
    let cancelled = || {
        ToolOutcome::Error(ToolError::Cancelled {
            tool_name: call.tool_name.clone(),
        })
    };

    let _permit: OwnedSemaphorePermit = tokio::select! {
        biased;
        () = cancel.cancelled() => return cancelled(),
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return cancelled(),
        },
    };
    let _serial = match &serial {
        Some(lock) => Some(tokio::select! {
            biased;
            () = cancel.cancelled() => return cancelled(),
            guard = lock.lock() => guard,
        }),
        None => None,
    };

    let ctx = InvocationContext::new(run_id.clone(), call.call_id.clone(), cancel.clone());
    let outcome = deps
        .tool_retry
        .run(cancel, ToolError::is_retryable, |attempt| {
            let ctx = &ctx;
            async move {
                let result = deps
                    .executor
                    .invoke(&call.tool_name, call.payload.clone(), ctx)
                    .await;
                if let Err(error) = &result
                    && error.is_retryable()
                {
                    warn!(
                        target: "helm::tools",
                        run_id = %ctx.run_id,
                        call_id = %ctx.call_id,
                        tool = %call.tool_name,
                        attempt,
                        error = %error,
                        "Tool invocation failed, retrying"
                    );
                }
                result
            }
        })
        .await;

    match outcome {
        RetryOutcome::Done(output) => ToolOutcome::Output(output),
        RetryOutcome::Failed(error) => ToolOutcome::Error(error),
        RetryOutcome::Exhausted { attempts, last } => ToolOutcome::Exhausted {
            error: last,
            attempts,
        },
        RetryOutcome::Cancelled => cancelled(),
    }
}
