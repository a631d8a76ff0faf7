pub mod cache;
pub mod orchestrator;
pub mod source;
