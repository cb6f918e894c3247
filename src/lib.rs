//! Library crate for sub-probe-rs exposing reusable modules.
pub mod config;
pub mod dedupe;
pub mod dispatcher;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod parse;
pub mod pipeline;
pub mod probe;
pub mod report;
pub mod score;
pub mod sources;
pub mod types;
