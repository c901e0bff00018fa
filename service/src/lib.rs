//! Inkwell service
//!
//! Operator CLI and periodic trigger loop around the season engine, plus the
//! HTTP-backed [`ContentGenerator`](inkwell_engine::ContentGenerator).

pub mod cli;
pub mod http_generator;

pub use cli::Cli;
pub use http_generator::HttpContentGenerator;
