//! Conversation routing — intent classification, drafting, and the
//! thread-lifecycle state machine.

pub mod classifier;
pub mod drafter;
pub mod engine;
pub mod types;

pub use classifier::IntentClassifier;
pub use drafter::{DraftEngine, DraftOutcome};
pub use engine::Router;
pub use types::{EmailContext, Intent, ThreadSelector};
