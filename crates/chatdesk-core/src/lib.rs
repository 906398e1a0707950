pub mod classify;
pub mod ingest;
pub mod model;
pub mod wire;

pub use classify::{classify, partition, Category, CategoryCounts, CategoryViews};
pub use ingest::{ConversationTarget, InboundEvent, IngestError, SendFailure};
pub use model::{
    ConversationGroup, ConversationKey, Direction, DispositionRef, Message, MessageId, MessageKind,
};
