pub mod agenda;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod execution;
pub mod expression;
pub mod graph;
pub mod lifecycle;
pub mod multi_instance;
pub mod redis_storage;
pub mod storage;
pub mod termination;
