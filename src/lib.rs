//! Patchup library crate
//!
//! Exposes the runner, fixer, and patcher subsystems so integration tests
//! and external tooling can drive them without going through CLI startup.

pub mod exec;
pub mod fix;
pub mod generate;
pub mod patch;
pub mod pipeline;
pub mod runner;
pub mod util;
