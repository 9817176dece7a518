pub mod controller;
pub mod error;
pub mod format;
pub mod transport;

pub use controller::{ControllerConfig, CycleOutcome, SessionController, ERROR_MESSAGE, FINISHED};
pub use error::EngineError;
pub use format::decorate;
pub use transport::Transport;
