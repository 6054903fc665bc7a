//! Protocol translation between the typed-block and flat-message formats.
//!
//! The core of the bridge: converts requests, responses, and streaming events
//! between the two wire protocols. Everything here is pure (no I/O).

pub mod flat;
pub mod request;
pub mod response;
pub mod streaming;
pub mod tools;
pub mod typed;

pub use request::RequestTranslator;
pub use response::{body_to_typed, flat_to_typed};
pub use streaming::{StreamReframer, UpstreamFrame};
