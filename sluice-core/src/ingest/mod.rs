//! Intake: validation, deduplication, prioritization, admission control,
//! duplicate folding, and completion fan-out.

mod ingester;
mod submitter;

pub use ingester::{
    CompletionLoop, DropLoop, IngestLoop, Ingester, RetryLoop, drop_chance,
    determine_resubmit_selected, must_drop, should_resubmit,
};
pub use submitter::Submitter;
