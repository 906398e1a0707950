pub mod aggregator;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod notice;
pub mod poll;
pub mod push;
pub mod selection;
pub mod store;

pub use aggregator::{Aggregator, IngestReport, PollSnapshot, StoreView};
pub use commands::{
    CommandDispatcher, CommandOutcome, CommandSink, CommandStatus, HttpCommandSink,
    MutationCommand,
};
pub use config::EngineConfig;
pub use coordinator::{spawn, CoordinatorHandle, CoordinatorState};
pub use error::{CommandError, TransportError};
pub use notice::{Connectivity, Notice};
pub use poll::{HttpPollSource, PollBatch, PollSource};
pub use push::{PushItem, PushSession, PushSource, WsPushSource};
pub use selection::SelectionTracker;
pub use store::{ConversationStore, DispositionScope, UpsertOutcome};
