pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::FlowConfig;
pub use error::{FlowError, GraphError, GraphViolation, Result};
pub use event::EventBus;
pub use traits::{FailureAction, FailurePolicy, Worker};
pub use types::*;
