//! Response policies applied after decoding: finish-reason resolution,
//! opt-in continuation heuristics, and prediction reuse.

pub mod continuation;
pub mod finish;
pub mod prediction;

pub use finish::{FinishPolicy, ToolCallBehavior};
