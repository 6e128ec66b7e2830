//! The wire format: length-prefixed framing and the typed message codec.
//!
//! Bytes flow `Frame codec -> Message codec -> Channel handler` on the inbound side and
//! the reverse on the outbound side. The frame codec (`frame`) knows nothing about
//! message contents; the message codec (`message`) knows nothing about framing. They are
//! composed by wrapping a byte stream in `tokio_util::codec::Framed<_, FrameCodec>` and
//! running `Message::decode` / `Message::encode` over each frame's payload.

pub mod frame;
pub mod message;

pub use frame::FrameCodec;
pub use message::{Message, RequestMessage, ResponseMessage};
