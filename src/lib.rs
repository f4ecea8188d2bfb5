pub mod record;
pub mod parser;
pub mod masking;
pub mod patterns;
pub mod temporal;
pub mod anomaly;
pub mod queue;
pub mod ai;
pub mod summarize;
pub mod query;
pub mod alerts;
pub mod gateway;
pub mod server;
pub mod config;
pub mod multiline;

pub use gateway::{Gateway, Health, Pipeline, PipelineError};
