//! AFC wire constants

/// Declares the opcode table once; the wire decode is generated from the
/// same listing so the two can never drift apart.
macro_rules! afc_opcodes {
    ($($name:ident = $value:literal),+ $(,)?) => {
        /// Operation codes of the AFC protocol
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u64)]
        pub enum AfcOpcode {
            $($name = $value,)+
        }

        impl TryFrom<u64> for AfcOpcode {
            type Error = ();

            fn try_from(value: u64) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$name),)+
                    _ => Err(()),
                }
            }
        }
    };
}

afc_opcodes! {
    Status = 0x01,
    Data = 0x02,
    ReadDir = 0x03,
    ReadFile = 0x04,
    WriteFile = 0x05,
    WritePart = 0x06,
    Truncate = 0x07,
    RemovePath = 0x08,
    MakeDir = 0x09,
    GetFileInfo = 0x0a,
    GetDevInfo = 0x0b,
    WriteFileAtom = 0x0c,
    FileOpen = 0x0d,
    FileOpenRes = 0x0e,
    Read = 0x0f,
    Write = 0x10,
    FileSeek = 0x11,
    FileTell = 0x12,
    FileTellRes = 0x13,
    FileClose = 0x14,
    FileSetSize = 0x15,
    GetConInfo = 0x16,
    SetConOptions = 0x17,
    RenamePath = 0x18,
    SetFsBs = 0x19,
    SetSocketBs = 0x1a,
    FileLock = 0x1b,
    MakeLink = 0x1c,
    SetFileTime = 0x1e,
}

/// File open modes, with fopen semantics
#[derive(Clone, Copy, Debug)]
#[repr(u64)]
pub enum AfcFopenMode {
    RdOnly = 0x01,   // "r"
    Rw = 0x02,       // "r+", creates
    WrOnly = 0x03,   // "w", truncates
    Wr = 0x04,       // "w+", truncates
    Append = 0x05,   // "a"
    RdAppend = 0x06, // "a+"
}

/// Advisory lock operations for FileLock (flock semantics)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcLockType {
    Shared = 5,    // LOCK_SH | LOCK_NB
    Exclusive = 6, // LOCK_EX | LOCK_NB
    Unlock = 12,   // LOCK_UN | LOCK_NB
}
