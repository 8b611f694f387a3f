//! Types shared across the harvester.
//!
//! Chat identifiers, gateway messages and the normalized fetch result.

mod chat_id;
mod message;

pub use chat_id::*;
pub use message::*;
