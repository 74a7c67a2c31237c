//! MeshLink black-box test runner.
//!
//! Test cases are grouped by the node containers they need. The runner
//! provisions each group once, binds fresh containers to every case and
//! reports per-case and per-group outcomes.

pub mod case;
pub mod report;
pub mod runner;
pub mod scenarios;

pub use case::{FnCase, TestCase, TestGroup};
pub use report::{CaseReport, GroupReport, RunReport};
pub use runner::{run_all, run_group, select_groups};
