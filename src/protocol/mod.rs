//! Wire protocol for the native driver
//!
//! Frames are length-prefixed JSON in both directions:
//! - **Handshake**: `magic u32 LE | auth_key_len u32 LE | auth_key | wire u32 LE`,
//!   answered by a NUL-terminated ASCII string (`SUCCESS` means ready).
//! - **Query frame**: `token u64 LE | payload_len u32 LE | payload`, where the
//!   payload is the JSON array `[query_type, body?, global_opts?]`.
//! - **Response frame**: same framing; the payload is `{t, r, n?, p?, b?}`.

pub mod codec;
pub mod error;
pub mod options;
pub mod response;
pub mod types;

pub use codec::{
    decode_header, encode_frame, encode_query, handshake_preamble, HANDSHAKE_SUCCESS, HEADER_SIZE,
    MAX_FRAME_SIZE,
};
pub use error::DriverError;
pub use options::{Format, FormatOptions, RunOptions};
pub use response::Response;
pub use types::{QueryType, ResponseNote, ResponseType};
