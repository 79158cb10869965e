use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use super::action::{Action, Orphan, PlannedCall, ToolOutcome};
use super::effect::Effect;
use super::state::RunState;
use crate::api::StopReason;
use crate::events::{PauseReason, ResumeDecision, RunEvent};
use crate::session::RunStatus;
use crate::types::CallId;
use helm_tools::{ErrorKind, ResultCode, ToolError};

pub const STEP_LIMIT_REASON: &str = "step limit exceeded";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReduceError {
    #[error("Run is {status}: {message}")]
    InvalidAction { status: RunStatus, message: String },
}

pub fn reduce(state: &mut RunState, action: Action) -> Result<Vec<Effect>, ReduceError> {
    match action {
        Action::Start => handle_start(state),
        Action::Rehydrated {
            orphans,
            awaiting,
            confirming,
        } => Ok(handle_rehydrated(state, orphans, awaiting, confirming)),
        Action::ModelChunk { step, text } => Ok(handle_model_chunk(state, step, text)),
        Action::ModelFinished { step } => Ok(handle_model_finished(state, step)),
        Action::ModelToolCalls { step, calls } => Ok(handle_model_tool_calls(state, step, calls)),
        Action::ModelStopped { step, reason } => Ok(handle_model_stopped(state, step, reason)),
        Action::ModelFailed {
            step,
            kind,
            message,
        } => Ok(handle_model_failed(state, step, kind, message)),
        Action::ToolFinished {
            call_id,
            tool_name,
            outcome,
        } => Ok(handle_tool_finished(state, call_id, tool_name, outcome)),
        Action::PauseRequested => handle_pause(state),
        Action::ResumeRequested { decision } => handle_resume(state, decision),
        Action::CancelRequested { reason } => Ok(handle_cancel(state, reason)),
    }
}

fn invalid(state: &RunState, message: impl Into<String>) -> ReduceError {
    ReduceError::InvalidAction {
        status: state.status,
        message: message.into(),
    }
}

fn handle_start(state: &mut RunState) -> Result<Vec<Effect>, ReduceError> {
    let mut effects = Vec::new();
    match state.status {
        RunStatus::Pending => {
            state.status = RunStatus::Running;
            effects.push(Effect::SetStatus(RunStatus::Running));
        }
        RunStatus::Running if state.step == 0 && state.is_quiescent() => {}
        _ => return Err(invalid(state, "run has already started")),
    }
    effects.extend(begin_step(state));
    Ok(effects)
}

fn begin_step(state: &mut RunState) -> Vec<Effect> {
    if state.explicit_pause {
        state.step_deferred = true;
        return Vec::new();
    }
    if state.step >= state.max_steps {
        return finish(state, RunStatus::Failed, Some(STEP_LIMIT_REASON.to_string()));
    }
    state.step += 1;
    state.step_deferred = false;
    state.generating = Some(state.step);
    state.streamed.clear();
    vec![Effect::CallModel { step: state.step }]
}

/// Append the terminal event and persist the final status.
fn finish(state: &mut RunState, status: RunStatus, reason: Option<String>) -> Vec<Effect> {
    state.status = status;
    state.generating = None;
    state.in_flight.clear();
    state.awaiting.clear();
    state.confirming = None;
    vec![
        Effect::Append(RunEvent::terminal(status, reason)),
        Effect::SetStatus(status),
        Effect::Finish,
    ]
}

fn fail(state: &mut RunState, kind: ErrorKind, message: String) -> Vec<Effect> {
    let mut effects = vec![
        Effect::CancelInFlight,
        Effect::Append(RunEvent::Error {
            kind,
            message: message.clone(),
        }),
    ];
    effects.extend(finish(state, RunStatus::Failed, Some(message)));
    effects
}

/// Start the next step once nothing is outstanding.
fn continue_if_quiescent(state: &mut RunState) -> Vec<Effect> {
    if state.is_terminal() || !state.is_quiescent() {
        return Vec::new();
    }
    begin_step(state)
}

/// Open a confirmation pause for the next waiting call, if none is open.
fn next_confirmation(state: &mut RunState) -> Vec<Effect> {
    if state.confirming.is_some() {
        return Vec::new();
    }
    let Some(call) = state.awaiting.pop_front() else {
        return Vec::new();
    };
    let (title, prompt) = call
        .confirmation
        .as_ref()
        .map(|c| (Some(c.title.clone()), Some(c.prompt.clone())))
        .unwrap_or_default();
    let event = RunEvent::Pause {
        reason: PauseReason::Confirmation,
        call_id: Some(call.call_id.clone()),
        title,
        prompt,
    };
    state.confirming = Some(call);
    let mut effects = vec![Effect::Append(event)];
    if state.status != RunStatus::Paused {
        state.status = RunStatus::Paused;
        effects.push(Effect::SetStatus(RunStatus::Paused));
    }
    effects
}

fn handle_rehydrated(
    state: &mut RunState,
    orphans: Vec<Orphan>,
    awaiting: Vec<PlannedCall>,
    confirming: Option<PlannedCall>,
) -> Vec<Effect> {
    if state.is_terminal() {
        return Vec::new();
    }
    state.in_flight.clear();
    state.generating = None;
    state.streamed.clear();

    if let Some(orphan) = orphans.iter().find(|o| !o.idempotent) {
        let message = format!(
            "Tool call {} to {} was interrupted and the tool is not idempotent",
            orphan.call.call_id, orphan.call.tool_name
        );
        return fail(state, ErrorKind::Permanent, message);
    }

    let mut effects = Vec::new();
    if confirming.is_some() {
        state.confirming = confirming;
    }
    state.awaiting.extend(awaiting);
    for orphan in orphans {
        debug!(
            target: "helm::engine",
            run_id = %state.run_id,
            call_id = %orphan.call.call_id,
            "Re-dispatching orphaned idempotent call"
        );
        state
            .in_flight
            .insert(orphan.call.call_id.clone(), orphan.call.clone());
        effects.push(Effect::DispatchTool(orphan.call));
    }
    effects.extend(next_confirmation(state));
    if state.status == RunStatus::Paused && state.confirming.is_none() && !state.explicit_pause {
        state.status = RunStatus::Running;
        effects.push(Effect::SetStatus(RunStatus::Running));
    }
    effects.extend(continue_if_quiescent(state));
    effects
}

fn is_current(state: &RunState, step: u32) -> bool {
    !state.is_terminal() && state.generating == Some(step)
}

fn handle_model_chunk(state: &mut RunState, step: u32, text: String) -> Vec<Effect> {
    if !is_current(state, step) || text.is_empty() {
        return Vec::new();
    }
    state.streamed.push_str(&text);
    vec![Effect::Append(RunEvent::AssistantChunk { text })]
}

fn handle_model_finished(state: &mut RunState, step: u32) -> Vec<Effect> {
    if !is_current(state, step) {
        return Vec::new();
    }
    state.generating = None;
    let text = std::mem::take(&mut state.streamed);
    let mut effects = vec![Effect::Append(RunEvent::AssistantMessage { text })];
    effects.extend(finish(state, RunStatus::Completed, None));
    effects
}

fn handle_model_tool_calls(state: &mut RunState, step: u32, calls: Vec<PlannedCall>) -> Vec<Effect> {
    if !is_current(state, step) {
        return Vec::new();
    }
    state.generating = None;
    if calls.is_empty() {
        return finish(state, RunStatus::Completed, None);
    }

    let mut effects = Vec::new();
    for call in calls {
        if !state.seen_calls.insert(call.call_id.clone()) {
            debug!(
                target: "helm::engine",
                run_id = %state.run_id,
                call_id = %call.call_id,
                "Ignoring repeated call id"
            );
            continue;
        }
        effects.push(Effect::Append(RunEvent::ToolCall {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            payload: call.payload.clone(),
        }));
        if call.confirmation.is_some() {
            state.awaiting.push_back(call);
        } else {
            state.in_flight.insert(call.call_id.clone(), call.clone());
            effects.push(Effect::DispatchTool(call));
        }
    }
    effects.extend(next_confirmation(state));
    effects.extend(continue_if_quiescent(state));
    effects
}

fn handle_model_stopped(state: &mut RunState, step: u32, reason: StopReason) -> Vec<Effect> {
    if !is_current(state, step) {
        return Vec::new();
    }
    state.generating = None;
    if reason.is_success() {
        finish(state, RunStatus::Completed, None)
    } else {
        finish(state, RunStatus::Failed, Some(reason.to_string()))
    }
}

fn handle_model_failed(
    state: &mut RunState,
    step: u32,
    kind: ErrorKind,
    message: String,
) -> Vec<Effect> {
    if !is_current(state, step) || kind == ErrorKind::Canceled {
        return Vec::new();
    }
    state.generating = None;
    fail(state, kind, message)
}

fn error_result(error: &ToolError) -> Value {
    json!({ "error": error.to_string() })
}

fn handle_tool_finished(
    state: &mut RunState,
    call_id: CallId,
    tool_name: String,
    outcome: ToolOutcome,
) -> Vec<Effect> {
    if state.is_terminal() || state.in_flight.remove(&call_id).is_none() {
        return Vec::new();
    }

    let (result_code, result, sidecar, fatal) = match outcome {
        ToolOutcome::Output(output) => (ResultCode::Ok, output.result, output.sidecar, None),
        ToolOutcome::Exhausted { error, attempts } => (
            error.result_code(),
            error_result(&error),
            None,
            Some(format!("{error} (after {attempts} attempts)")),
        ),
        ToolOutcome::Error(error) => {
            let fatal = matches!(error, ToolError::Backend { .. }).then(|| error.to_string());
            (error.result_code(), error_result(&error), None, fatal)
        }
    };

    let mut effects = vec![Effect::Append(RunEvent::ToolResult {
        call_id,
        tool_name,
        result_code,
        result,
        sidecar,
    })];
    match fatal {
        Some(message) => effects.extend(fail(state, ErrorKind::Permanent, message)),
        None => effects.extend(continue_if_quiescent(state)),
    }
    effects
}

fn handle_pause(state: &mut RunState) -> Result<Vec<Effect>, ReduceError> {
    if state.is_terminal() {
        return Err(invalid(state, "cannot pause a finished run"));
    }
    if state.explicit_pause {
        return Ok(Vec::new());
    }
    state.explicit_pause = true;
    let mut effects = vec![Effect::Append(RunEvent::Pause {
        reason: PauseReason::Requested,
        call_id: None,
        title: None,
        prompt: None,
    })];
    if state.status != RunStatus::Paused {
        state.status = RunStatus::Paused;
        effects.push(Effect::SetStatus(RunStatus::Paused));
    }
    Ok(effects)
}

fn handle_resume(
    state: &mut RunState,
    decision: ResumeDecision,
) -> Result<Vec<Effect>, ReduceError> {
    if state.status != RunStatus::Paused {
        return Err(invalid(state, "run is not paused"));
    }
    let mut effects = vec![Effect::Append(RunEvent::Resume { decision })];
    state.explicit_pause = false;

    if let Some(call) = state.confirming.take() {
        match decision {
            ResumeDecision::Accept => {
                state.approved.insert(call.call_id.clone());
                state.in_flight.insert(call.call_id.clone(), call.clone());
                effects.push(Effect::DispatchTool(call));
            }
            ResumeDecision::Deny => {
                let denied = call
                    .confirmation
                    .as_ref()
                    .map_or_else(|| format!("{} was declined", call.tool_name), |c| {
                        c.denied_result.clone()
                    });
                effects.push(Effect::Append(RunEvent::ToolResult {
                    call_id: call.call_id,
                    tool_name: call.tool_name,
                    result_code: ResultCode::Denied,
                    result: Value::String(denied),
                    sidecar: None,
                }));
            }
        }
    }

    let pause = next_confirmation(state);
    if pause.is_empty() {
        state.status = RunStatus::Running;
        effects.push(Effect::SetStatus(RunStatus::Running));
        effects.extend(continue_if_quiescent(state));
    } else {
        effects.extend(pause);
    }
    Ok(effects)
}

fn handle_cancel(state: &mut RunState, reason: Option<String>) -> Vec<Effect> {
    if state.is_terminal() {
        return Vec::new();
    }
    let mut effects = vec![Effect::CancelInFlight];
    effects.extend(finish(state, RunStatus::Canceled, reason));
    effects
}
