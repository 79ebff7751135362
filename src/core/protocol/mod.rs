// src/core/protocol/mod.rs

//! The RPC surface: length-delimited binary frames carried over a streaming
//! transport. Requests are answered with an immediate submission response;
//! completions arrive later as `Notify` frames on the same stream.

pub mod codec;
pub mod messages;

pub use codec::FrameCodec;
pub use messages::*;
