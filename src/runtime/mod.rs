pub mod clock;
pub mod command;
pub mod commands;
pub mod context;
pub mod engine;
pub mod events;
pub mod expression;
pub mod jobs;
pub mod model;
pub mod redis_storage;
pub mod storage;
pub mod transaction;
pub mod tree;
pub mod variables;
