//! Wire protocol: message types, bounded (de)serialization, and the session
//! engine that drives one peer exchange to completion.

pub mod message;
pub mod serde_safe;
pub mod session;

pub use message::{Message, NackReason, OfferItem, OfferItems, WantItems, PROTOCOL_VERSION};
pub use session::{run_session, SessionError};
