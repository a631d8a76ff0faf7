pub mod llm;
pub mod service;
