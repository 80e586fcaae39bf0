#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod config;
pub mod paths;
pub mod registry;
pub mod relocation;
pub mod service;
pub mod transform;
mod worker;

pub use config::JobPipelineConfig;
#[allow(clippy::module_name_repetitions)]
pub use service::{ConfigureJobRequest, CreateJobRequest, JobService, UpdateJobRequest};
pub use transform::{ImageTransformer, RasterTransformer};
