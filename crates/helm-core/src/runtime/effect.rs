use super::action::PlannedCall;
use crate::events::RunEvent;
use crate::session::RunStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Append to the event log, then publish on the bus.
    Append(RunEvent),

    /// Persist the run status in `RunMeta`.
    SetStatus(RunStatus),

    CallModel {
        step: u32,
    },

    DispatchTool(PlannedCall),

    /// Abort the in-flight model stream and tool invocations.
    CancelInFlight,

    /// Stop the mailbox and release the lease.
    Finish,
}
