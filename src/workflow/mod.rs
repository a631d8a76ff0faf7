pub mod coordinator;
pub mod store;
pub mod types;
