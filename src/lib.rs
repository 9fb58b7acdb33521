//! SENTINEL: AI-gated on-chain trade execution engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod models;
pub mod ledger;
pub mod data;
pub mod engine;
pub mod storage;
