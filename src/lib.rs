pub mod aggregate;
pub mod clock;
pub mod config;
pub mod detect;
pub mod error;
pub mod job;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod query;
pub mod record;
pub mod retry;
pub mod sink;
pub mod stats;
pub mod upload;
