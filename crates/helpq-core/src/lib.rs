pub mod clock;
pub mod session;
pub mod status;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use session::{is_live, SessionState};
pub use status::StudentStatus;
pub use types::*;
