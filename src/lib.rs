//! stackrun — run infrastructure-as-code modules in dependency order.
//!
//! Resolves a tree of modules into a stack, plans leveled run graphs
//! (dependencies first for apply, dependents first for destroy) and executes
//! them in parallel with cascade skips, retries and cancellation.

pub mod cli;
pub mod core;
pub mod transport;
