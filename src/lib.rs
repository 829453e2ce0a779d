//! Conversational data-analysis pipeline: one natural-language request in,
//! one verified, narrated analysis out.

pub mod backend;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod metadata;
pub mod pipeline;
pub mod server;
