//! Stream consumer worker for the booru gateway.

pub mod config;
pub mod dlq_consumer;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod validation;

pub use config::{CacheBackendKind, WorkerConfig};
pub use dlq_consumer::DlqConsumer;
pub use error::{WorkerError, WorkerResult};
pub use executor::WorkerPool;
pub use pipeline::ProcessingContext;
pub use validation::{ValidationError, Validator};
