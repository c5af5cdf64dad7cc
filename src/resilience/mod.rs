//! Resilience helpers for backend calls.

pub mod retry;
