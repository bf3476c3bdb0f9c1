//! JSON envelope protocol spoken between publishers, the broker and subscribers.

pub mod message;
pub mod types;

pub use message::{Envelope, Event};
pub use types::EventType;
