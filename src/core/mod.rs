pub mod clock;
pub mod error;

pub use clock::{Clock, ManualClock, SystemClock, hour_start, unix_seconds};
pub use error::{EngineError, Result};
