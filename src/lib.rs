pub mod authenticity;
pub mod catalog;
pub mod config;
pub mod core;
pub mod knowledge;
pub mod matching;
pub mod pricing;
pub mod reasoning;
pub mod vision;
pub mod workflow;
