use crate::commands::CommandOutcome;
use chatdesk_core::ingest::SendFailure;
use chatdesk_core::model::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Degraded,
    Restored,
}

/// Side-channel signals for the observer, separate from the group listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    NewInbound(Message),
    SendFailed(SendFailure),
    Connectivity(Connectivity),
    Command(CommandOutcome),
}
