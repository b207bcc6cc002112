pub mod discovery;
pub mod dlog;
pub mod error;
pub mod instrument;
pub mod protocol;
pub mod transport;

// Re-export the primary types so users can drive an acquisition
// without knowing the internal module layout.
pub use discovery::{ModuleMap, ModuleRole, Slot};
pub use dlog::{RawLog, SampleFormat, SampleStream};
pub use error::{Error, Result};
pub use instrument::*;
pub use transport::{ReadOutcome, SessionId, Status, Transport};
