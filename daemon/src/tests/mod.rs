//! Test modules for the daemon crate

mod ipc_tests;
mod memory_tests;
