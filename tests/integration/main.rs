//! End-to-end tests: collector → forecaster → validator → submitter →
//! mock ledger → history, plus the scheduler and the `TradingSystem` facade.

mod common;
mod pipeline;
mod system;
