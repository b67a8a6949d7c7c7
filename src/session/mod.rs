//! Session identity, storage isolation, and access-time bookkeeping.

mod clock;
mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use registry::{SessionError, SessionGuard, SessionInfo, SessionRegistry};
