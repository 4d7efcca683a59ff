pub mod clock;
pub mod error;
pub mod peripherals;
pub mod record;
pub mod sampler;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod upload;

pub use error::PipelineError;
