// Timing primitives shared by the leveling and moderation features.

pub mod clock;
pub mod deferred;
pub mod periodic;

pub use clock::{Clock, SystemClock};
pub use deferred::DeferredScheduler;
pub use periodic::{format_countdown, PeriodicTask};
