/// Declares each status code with its message once; the numeric decode and
/// the `Display` text both come from this single table.
macro_rules! afc_status_codes {
    ($($name:ident = $code:literal, $desc:literal;)+) => {
        /// Status codes the AFC service reports
        ///
        /// `OpWouldBlock` is the one recoverable code: a contended lock
        /// answers it and callers retry.
        #[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
        #[non_exhaustive]
        pub enum AfcError {
            $(
                #[error($desc)]
                $name = $code,
            )+
        }

        impl From<u64> for AfcError {
            fn from(value: u64) -> Self {
                match value {
                    $($code => Self::$name,)+
                    _ => Self::UnknownError,
                }
            }
        }
    };
}

afc_status_codes! {
    Success = 0, "success";
    UnknownError = 1, "unknown error";
    OpHeaderInvalid = 2, "operation header invalid";
    NoResources = 3, "no resources available";
    ReadError = 4, "read error";
    WriteError = 5, "write error";
    UnknownPacketType = 6, "unknown packet type";
    InvalidArg = 7, "invalid argument";
    ObjectNotFound = 8, "object not found";
    ObjectIsDir = 9, "object is a directory";
    PermDenied = 10, "permission denied";
    ServiceNotConnected = 11, "service not connected";
    OpTimeout = 12, "operation timed out";
    TooMuchData = 13, "too much data";
    EndOfData = 14, "end of data";
    OpNotSupported = 15, "operation not supported";
    ObjectExists = 16, "object already exists";
    ObjectBusy = 17, "object is busy";
    NoSpaceLeft = 18, "no space left";
    OpWouldBlock = 19, "operation would block";
    IoError = 20, "i/o error";
    OpInterrupted = 21, "operation interrupted";
    OpInProgress = 22, "operation in progress";
    InternalError = 23, "internal error";
    MuxError = 30, "multiplexer error";
    NoMem = 31, "out of memory";
    NotEnoughData = 32, "not enough data";
    DirNotEmpty = 33, "directory not empty";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_decode_and_describe() {
        assert_eq!(AfcError::from(19), AfcError::OpWouldBlock);
        assert_eq!(AfcError::OpWouldBlock.to_string(), "operation would block");
        assert_eq!(AfcError::from(8).to_string(), "object not found");
        // Codes the table doesn't know fall back to the generic error
        assert_eq!(AfcError::from(999), AfcError::UnknownError);
    }
}
