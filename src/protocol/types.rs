use super::error::DriverError;

/// Protocol version magic sent first during the handshake.
pub const VERSION_V0_4: u32 = 0x400c_2d20;

/// Wire serialization selector sent last during the handshake.
pub const WIRE_PROTOCOL_JSON: u32 = 0x7e69_70c7;

/// Term type used to wrap a database name in the global options.
pub const TERM_DB: u64 = 14;

/// Query frame types, the first element of every query payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum QueryType {
    Start = 1,
    Continue = 2,
    Stop = 3,
    NoreplyWait = 4,
}

/// Response type codes, the `t` field of every response object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ResponseType {
    SuccessAtom = 1,
    SuccessSequence = 2,
    SuccessPartial = 3,
    WaitComplete = 4,
    ClientError = 16,
    CompileError = 17,
    RuntimeError = 18,
}

impl ResponseType {
    /// Decode a wire type code. Unknown codes are a protocol violation.
    pub fn from_wire(code: u64) -> Result<Self, DriverError> {
        match code {
            1 => Ok(ResponseType::SuccessAtom),
            2 => Ok(ResponseType::SuccessSequence),
            3 => Ok(ResponseType::SuccessPartial),
            4 => Ok(ResponseType::WaitComplete),
            16 => Ok(ResponseType::ClientError),
            17 => Ok(ResponseType::CompileError),
            18 => Ok(ResponseType::RuntimeError),
            other => Err(DriverError::Protocol(format!(
                "unknown response type code {}",
                other
            ))),
        }
    }
}

/// Response note codes, the `n` field of a response object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ResponseNote {
    SequenceFeed = 1,
    AtomFeed = 2,
    OrderByLimitFeed = 3,
    UnionedFeed = 4,
    IncludesStates = 5,
}

impl ResponseNote {
    /// Decode a wire note code. Unknown notes are ignored by the caller.
    pub fn from_wire(code: u64) -> Option<Self> {
        match code {
            1 => Some(ResponseNote::SequenceFeed),
            2 => Some(ResponseNote::AtomFeed),
            3 => Some(ResponseNote::OrderByLimitFeed),
            4 => Some(ResponseNote::UnionedFeed),
            5 => Some(ResponseNote::IncludesStates),
            _ => None,
        }
    }

    /// True when the note marks the stream as a changefeed.
    pub fn is_feed(&self) -> bool {
        matches!(
            self,
            ResponseNote::SequenceFeed
                | ResponseNote::AtomFeed
                | ResponseNote::OrderByLimitFeed
                | ResponseNote::UnionedFeed
        )
    }
}
