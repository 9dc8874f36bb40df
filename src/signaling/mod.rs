//! Signal channel: session-scoped delivery of offers, answers and ICE
//! candidates between the two participants of a consultation.

pub mod channel;
pub mod memory;
pub mod types;

pub use channel::{listen, SignalChannel, Subscription};
pub use memory::MemorySignalChannel;
pub use types::{SignalBody, SignalDocument, SignalKind, SignalMessage};
