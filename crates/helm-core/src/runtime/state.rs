use std::collections::{BTreeMap, HashSet, VecDeque};

use super::action::PlannedCall;
use crate::events::{PauseReason, ResumeDecision, RunEvent};
use crate::session::RunStatus;
use crate::types::{CallId, RunId};

/// In-memory state of one run, owned by its mailbox.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    pub run_id: RunId,
    pub status: RunStatus,
    pub step: u32,
    pub max_steps: u32,
    /// Step of the model call in flight, if any.
    pub generating: Option<u32>,
    /// Text streamed so far by the current model call.
    pub streamed: String,
    /// Dispatched calls awaiting their result.
    pub in_flight: BTreeMap<CallId, PlannedCall>,
    /// Calls waiting for a confirmation pause of their own.
    pub awaiting: VecDeque<PlannedCall>,
    /// The call the current confirmation pause is about.
    pub confirming: Option<PlannedCall>,
    pub explicit_pause: bool,
    /// A step came due while explicitly paused.
    pub step_deferred: bool,
    pub seen_calls: HashSet<CallId>,
    /// Calls whose confirmation was accepted.
    pub approved: HashSet<CallId>,
}

impl RunState {
    pub fn new(run_id: RunId, max_steps: u32) -> Self {
        Self {
            run_id,
            status: RunStatus::Pending,
            step: 0,
            max_steps,
            generating: None,
            streamed: String::new(),
            in_flight: BTreeMap::new(),
            awaiting: VecDeque::new(),
            confirming: None,
            explicit_pause: false,
            step_deferred: false,
            seen_calls: HashSet::new(),
            approved: HashSet::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Nothing is outstanding, so the next step may start.
    pub fn is_quiescent(&self) -> bool {
        self.generating.is_none()
            && self.in_flight.is_empty()
            && self.awaiting.is_empty()
            && self.confirming.is_none()
    }

    /// Rebuild state from one logged event. Calls left in `in_flight` after
    /// a full replay are orphans; `confirming` holds an undecided pause.
    pub fn apply_event(&mut self, event: &RunEvent) {
        match event {
            RunEvent::UserMessage { .. } => {
                if self.status == RunStatus::Pending {
                    self.status = RunStatus::Running;
                }
            }
            RunEvent::AssistantChunk { .. } => {}
            RunEvent::AssistantMessage { .. } => {
                self.step += 1;
            }
            RunEvent::ToolCall {
                call_id,
                tool_name,
                payload,
            } => {
                if self.in_flight.is_empty() && self.confirming.is_none() {
                    self.step += 1;
                }
                self.seen_calls.insert(call_id.clone());
                self.in_flight.insert(
                    call_id.clone(),
                    PlannedCall::new(call_id.clone(), tool_name.clone(), payload.clone()),
                );
            }
            RunEvent::ToolResult { call_id, .. } => {
                self.in_flight.remove(call_id);
            }
            RunEvent::Pause {
                reason: PauseReason::Confirmation,
                call_id,
                ..
            } => {
                self.status = RunStatus::Paused;
                if let Some(call_id) = call_id {
                    self.confirming = self.in_flight.remove(call_id);
                }
            }
            RunEvent::Pause {
                reason: PauseReason::Requested,
                ..
            } => {
                self.status = RunStatus::Paused;
                self.explicit_pause = true;
            }
            RunEvent::Resume { decision } => {
                self.explicit_pause = false;
                if let Some(call) = self.confirming.take()
                    && *decision == ResumeDecision::Accept
                {
                    self.approved.insert(call.call_id.clone());
                    self.in_flight.insert(call.call_id.clone(), call);
                }
                self.status = RunStatus::Running;
            }
            RunEvent::Error { .. } => {}
            RunEvent::Terminal { status, .. } => {
                self.status = *status;
                self.in_flight.clear();
                self.confirming = None;
            }
        }
    }

    /// Calls without a result after replay.
    pub fn unresolved(&self) -> Vec<PlannedCall> {
        self.in_flight.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_tools::ResultCode;
    use serde_json::json;

    fn call(id: &str) -> RunEvent {
        RunEvent::ToolCall {
            call_id: CallId::from(id),
            tool_name: "todos.list".into(),
            payload: json!({}),
        }
    }

    fn result(id: &str) -> RunEvent {
        RunEvent::ToolResult {
            call_id: CallId::from(id),
            tool_name: "todos.list".into(),
            result_code: ResultCode::Ok,
            result: json!({}),
            sidecar: None,
        }
    }

    #[test]
    fn replay_finds_orphaned_calls() {
        let mut state = RunState::new(RunId::from("r"), 10);
        for event in [
            RunEvent::UserMessage { text: "hi".into() },
            call("c1"),
            call("c2"),
            result("c1"),
        ] {
            state.apply_event(&event);
        }
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.step, 1);
        let orphans = state.unresolved();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].call_id, CallId::from("c2"));
        assert!(state.seen_calls.contains(&CallId::from("c1")));
    }

    #[test]
    fn replay_restores_pending_confirmation() {
        let mut state = RunState::new(RunId::from("r"), 10);
        for event in [
            RunEvent::UserMessage { text: "hi".into() },
            call("c1"),
            RunEvent::Pause {
                reason: PauseReason::Confirmation,
                call_id: Some(CallId::from("c1")),
                title: None,
                prompt: None,
            },
        ] {
            state.apply_event(&event);
        }
        assert_eq!(state.status, RunStatus::Paused);
        assert!(state.in_flight.is_empty());
        assert_eq!(
            state.confirming.as_ref().map(|c| c.call_id.clone()),
            Some(CallId::from("c1"))
        );
    }
}
