//! Aggregation pipeline: codecs, stages, worker pool over input
//! partitions, idempotent output publishing and periodic checkpoints.

pub mod codec;
pub mod config;
pub mod error;
mod engine;
mod publisher;
mod source;
mod stages;
mod stats;
mod worker;

pub use codec::{ClickCodec, WeatherCodec, codec_for};
pub use engine::{Engine, assign_partitions};
pub use error::PipelineError;
pub use publisher::{OutputPublisher, OutputRecord};
pub use source::LineSource;
pub use stages::{Outcome, Pipeline, Stages, celsius_to_fahrenheit};
pub use stats::{Counter, PipelineStats, StatsSnapshot, WorkerPhase};
