pub mod backoff;
pub mod clock;
pub mod telemetry;

pub use backoff::*;
pub use clock::*;
pub use telemetry::*;
