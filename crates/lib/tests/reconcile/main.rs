//! End-to-end reconciliation scenarios against the in-memory runtime.

mod apply_tests;
mod common;
mod destroy_tests;
mod eval_tests;
mod plan_tests;
