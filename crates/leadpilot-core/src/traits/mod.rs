//! Collaborator boundaries.

pub mod composer;
pub mod sender;
pub mod store;

pub use composer::{CompositionContext, MessageComposer, TemplateComposer};
pub use sender::OutboundSender;
pub use store::{
    ChangeFeed, Datastore, ExecutionStore, LeadStore, OutboxStore, PatternStore, RoutingStore,
    StageStore, TemplateStore,
};
