//! End-to-end scan tests for reconhive-core.
//!
//! Full `ScanLifecycle` runs with modules that drive real subprocesses.
//!
//! # Test Structure
//!
//! - `helpers/` -- preset builder, test modules, polling assertions
//! - `scenarios/` -- one file per scenario
//!
//! # Running
//!
//! ```bash
//! cargo test -p reconhive-core --test e2e
//! ```

mod helpers;
mod scenarios;
