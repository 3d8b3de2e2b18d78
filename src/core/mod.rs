//! Core stack logic — types, parsing, resolution, planning, execution.

pub mod dependents;
pub mod error;
pub mod executor;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod stack;
pub mod types;
