pub mod batch;
pub mod export;
pub mod walk_forward;

pub use batch::{BatchConfig, BatchRunner, BatchSummary, SearchMethod};
pub use export::{export_batch, export_walk_forward};
pub use walk_forward::{WalkForwardConfig, WalkForwardRunner, WalkForwardSummary};
