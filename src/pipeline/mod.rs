//! The per-turn analysis pipeline, leaves first: ground truth and retry
//! feed generation, which feeds exploration context into the session driver.

pub mod commentary;
pub mod explore;
pub mod generate;
pub mod ground_truth;
pub mod retry;
pub mod session;

pub use ground_truth::{extract_ground_truth, GroundTruthFact};
pub use retry::{classify_failure, ErrorClassification, DEFAULT_MAX_RETRIES};
pub use session::{SessionPipeline, TurnRequest};
