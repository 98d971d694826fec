//! Gateway wire protocol
//!
//! Frames are JSON envelopes `{op, d, s, t}`. Inbound frames decode into the
//! closed [`Frame`] enum; unknown opcodes become [`Frame::Unknown`] instead of
//! failing the parse.

mod close;
mod frame;
mod opcode;

pub use close::{CloseAction, ClosePolicy};
pub use frame::{ConnectionProperties, Frame, IdentifyPayload, OutboundFrame, ResumePayload};
pub use opcode::OpCode;
