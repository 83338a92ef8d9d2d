// Postmark Kernel
//
// Crash-safe, at-most-once bookkeeping for feed aggregators.

pub mod clock;
pub mod document;
pub mod relay;
pub mod retention;
pub mod store;

pub use clock::{Clock, FixedClock, SystemClock};
pub use retention::RetentionPolicy;
pub use store::{DedupStore, StoreError};
