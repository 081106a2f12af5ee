pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::PipelineConfig;
pub use error::{ErrorKind, Result, SluiceError};
pub use event::EventBus;
pub use types::*;
