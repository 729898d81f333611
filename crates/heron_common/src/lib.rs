//! Shared pieces of HeronDB that every layer needs: the pluggable value
//! codec and tracing initialization for binaries.

mod codec;
mod telemetry;

pub use codec::{Codec, CodecError};
pub use telemetry::init_tracing;
