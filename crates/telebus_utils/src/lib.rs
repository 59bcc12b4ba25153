//! telebus_utils
//!
//! Small shared pieces used by every other crate: logging bootstrap and the
//! injectable `Clock`.

pub mod clock;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
