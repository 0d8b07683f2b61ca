//! Storage collaborators: the log store contract and its implementations.
pub mod log;
