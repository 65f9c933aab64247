//! Wire protocol: framing, correlation ids, message classification.
//!
//! ## Module Structure
//!
//! - `frame` - incremental `Content-Length` frame reader and encoder
//! - `request_id` - normalized correlation id
//! - `message` - inbound events (`Renor`) and outgoing messages
//! - `classifier` - payload classification and output gating

pub mod classifier;
pub mod frame;
pub mod message;
mod request_id;

pub use classifier::{DapClassifier, MessageClassifier};
pub use frame::{Frame, FrameReader, encode_frame};
pub use message::{Notification, Outgoing, Renor, Request, SequenceCounter};
pub use request_id::RequestId;
