//! E2E scenarios.

mod cancellation;
mod deadly_gate;
mod fault_isolation;
mod routing;
mod teardown;
