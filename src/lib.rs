// ENCLAVE-BENCH LIBRARY
// BENCHMARK PROCESS ORCHESTRATION AND TELEMETRY CAPTURE.
// EVERYTHING HERE IS TESTABLE OFFLINE; THE BINARY ADDS CLI, SIGNALS, SWEEPS.

pub mod artifact;
pub mod debug_mount;
pub mod environment;
pub mod export;
pub mod extract;
pub mod launcher;
pub mod ledger;
pub mod measure;
pub mod normalize;
pub mod profiling;
pub mod remote;
pub mod retry;
pub mod supervisor;
