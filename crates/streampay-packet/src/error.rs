use std::fmt;

/// The class of an ILP error code, given by its first letter.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorClass {
    Final,
    Temporary,
    Relative,
    Unknown,
}

/// A 3-character ILP error code, e.g. `F02`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode([u8; 3]);

impl ErrorCode {
    pub const fn new(bytes: [u8; 3]) -> Self {
        ErrorCode(bytes)
    }

    pub fn class(self) -> ErrorClass {
        match self.0[0] {
            b'F' => ErrorClass::Final,
            b'T' => ErrorClass::Temporary,
            b'R' => ErrorClass::Relative,
            _ => ErrorClass::Unknown,
        }
    }

    pub const F00_BAD_REQUEST: ErrorCode = ErrorCode(*b"F00");
    pub const F01_INVALID_PACKET: ErrorCode = ErrorCode(*b"F01");
    pub const F02_UNREACHABLE: ErrorCode = ErrorCode(*b"F02");
    pub const F03_INVALID_AMOUNT: ErrorCode = ErrorCode(*b"F03");
    pub const F04_INSUFFICIENT_DESTINATION_AMOUNT: ErrorCode = ErrorCode(*b"F04");
    pub const F05_WRONG_CONDITION: ErrorCode = ErrorCode(*b"F05");
    pub const F06_UNEXPECTED_PAYMENT: ErrorCode = ErrorCode(*b"F06");
    pub const F07_CANNOT_RECEIVE: ErrorCode = ErrorCode(*b"F07");
    pub const F08_AMOUNT_TOO_LARGE: ErrorCode = ErrorCode(*b"F08");
    pub const F99_APPLICATION_ERROR: ErrorCode = ErrorCode(*b"F99");
    pub const T00_INTERNAL_ERROR: ErrorCode = ErrorCode(*b"T00");
    pub const T01_PEER_UNREACHABLE: ErrorCode = ErrorCode(*b"T01");
    pub const T02_PEER_BUSY: ErrorCode = ErrorCode(*b"T02");
    pub const T03_CONNECTOR_BUSY: ErrorCode = ErrorCode(*b"T03");
    pub const T04_INSUFFICIENT_LIQUIDITY: ErrorCode = ErrorCode(*b"T04");
    pub const T05_RATE_LIMITED: ErrorCode = ErrorCode(*b"T05");
    pub const T99_APPLICATION_ERROR: ErrorCode = ErrorCode(*b"T99");
    pub const R00_TRANSFER_TIMED_OUT: ErrorCode = ErrorCode(*b"R00");
    pub const R01_INSUFFICIENT_SOURCE_AMOUNT: ErrorCode = ErrorCode(*b"R01");
    pub const R02_INSUFFICIENT_TIMEOUT: ErrorCode = ErrorCode(*b"R02");
    pub const R99_APPLICATION_ERROR: ErrorCode = ErrorCode(*b"R99");
}

impl AsRef<[u8]> for ErrorCode {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0[..]))
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ErrorCode({})", self)
    }
}
