//! Wire protocol between the simulator and the policy server

pub mod codec;
pub mod framing;

pub use codec::{decode, decode_bytes, encode_action, Request, RESPONSE_TERMINATOR};
pub use framing::{FrameReader, Framing, MAX_FRAME_BYTES};
