/// Result codes for every driver operation.
///
/// Native services report failures in their own vocabulary (MMRESULT, OSStatus).
/// Each platform driver translates those into `NativeError`, and every public
/// operation wraps the cause in a per-operation error naming the step that
/// failed. Across the C boundary an error becomes `stage * 100 + native code`,
/// with 0 meaning success.

use std::fmt;

/// Success across the C boundary.
pub const OK: i32 = 0;

/// A failure reported by the platform MIDI service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NativeError {
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid parameter or structure")]
    InvalidParameter,
    #[error("out of memory")]
    NoMemory,
    #[error("buffer is still in the driver queue")]
    StillPlaying,
    #[error("buffer is not prepared")]
    Unprepared,
    #[error("device already allocated")]
    Allocated,
    #[error("bad device id")]
    BadDeviceId,
    #[error("invalid flag")]
    InvalidFlag,
    #[error("no driver")]
    NoDriver,
    #[error("device not ready")]
    NotReady,
    #[error("operation not valid in the current open mode")]
    BadOpenMode,
    #[error("invalid client")]
    InvalidClient,
    #[error("invalid port")]
    InvalidPort,
    #[error("called from the wrong thread")]
    WrongThread,
    #[error("not permitted")]
    NotPermitted,
    #[error("unknown endpoint")]
    UnknownEndpoint,
    #[error("wrong endpoint type")]
    WrongEndpointType,
    #[error("no connection")]
    NoConnection,
    #[error("MIDI server failed to start")]
    ServerStart,
    #[error("message send failed")]
    MessageSend,
    #[error("unknown property")]
    UnknownProperty,
    #[error("property value too long")]
    PropertyTooLong,
    #[error("no resources")]
    NoResources,
    #[error("not supported by this driver")]
    Unsupported,
    #[error("unknown native error {0}")]
    Unknown(i32),
}

impl NativeError {
    /// Stable numeric code, unique per variant. All unknown values share 99.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidHandle => 1,
            Self::InvalidParameter => 2,
            Self::NoMemory => 3,
            Self::StillPlaying => 4,
            Self::Unprepared => 5,
            Self::Allocated => 6,
            Self::BadDeviceId => 7,
            Self::InvalidFlag => 8,
            Self::NoDriver => 9,
            Self::NotReady => 10,
            Self::BadOpenMode => 11,
            Self::InvalidClient => 12,
            Self::InvalidPort => 13,
            Self::WrongThread => 14,
            Self::NotPermitted => 15,
            Self::UnknownEndpoint => 16,
            Self::WrongEndpointType => 17,
            Self::NoConnection => 18,
            Self::ServerStart => 19,
            Self::MessageSend => 20,
            Self::UnknownProperty => 21,
            Self::PropertyTooLong => 22,
            Self::NoResources => 23,
            Self::Unsupported => 24,
            Self::Unknown(_) => 99,
        }
    }
}

/// Conversion of an error (or a whole result) into a C result code.
pub trait ResultCode {
    fn result_code(&self) -> i32;
}

impl<T, E: ResultCode> ResultCode for Result<T, E> {
    fn result_code(&self) -> i32 {
        match self {
            Ok(_) => OK,
            Err(e) => e.result_code(),
        }
    }
}

/// Declare a per-operation error: one variant per step of the operation, each
/// carrying the native cause. The number after each step is its stage, which
/// becomes the hundreds of the result code.
macro_rules! operation_error {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $stage:ident = $base:literal => $desc:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $( $stage(NativeError) ),+
        }

        impl $name {
            /// The native failure behind this error.
            pub fn cause(&self) -> NativeError {
                match self {
                    $( Self::$stage(e) => *e ),+
                }
            }
        }

        impl ResultCode for $name {
            fn result_code(&self) -> i32 {
                match self {
                    $( Self::$stage(e) => $base * 100 + e.code() ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $( Self::$stage(e) => write!(f, "{}: {}", $desc, e) ),+
                }
            }
        }

        impl std::error::Error for $name {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                match self {
                    $( Self::$stage(e) => Some(e) ),+
                }
            }
        }
    };
}

operation_error! {
    pub enum SessionOpenError {
        Create = 1 => "failed to create MIDI client",
    }
}

operation_error! {
    pub enum SessionCloseError {
        Dispose = 1 => "failed to dispose MIDI client",
    }
}

operation_error! {
    /// Enumeration or descriptor query failed.
    pub enum DescriptorError {
        Query = 1 => "failed to query device",
    }
}

operation_error! {
    pub enum PropertyError {
        Get = 1 => "failed to read device property",
    }
}

operation_error! {
    /// Reading one packet out of a delivered packet list failed.
    pub enum EventDataError {
        Read = 1 => "failed to read event data",
    }
}

operation_error! {
    pub enum InputOpenError {
        Open = 1 => "failed to open input device",
        PrepareBuffer = 2 => "failed to prepare SysEx buffer",
        AddBuffer = 3 => "failed to queue SysEx buffer",
    }
}

operation_error! {
    pub enum InputConnectError {
        Start = 1 => "failed to start input",
    }
}

operation_error! {
    pub enum InputDisconnectError {
        Stop = 1 => "failed to stop input",
    }
}

operation_error! {
    pub enum InputCloseError {
        Reset = 1 => "failed to reset input",
        UnprepareBuffer = 2 => "failed to unprepare SysEx buffer",
        Close = 3 => "failed to close input",
    }
}

operation_error! {
    pub enum PrepareBufferError {
        Prepare = 1 => "failed to prepare SysEx buffer",
        AddBuffer = 2 => "failed to queue SysEx buffer",
    }
}

operation_error! {
    pub enum UnprepareBufferError {
        Unprepare = 1 => "failed to unprepare SysEx buffer",
    }
}

operation_error! {
    pub enum RenewBufferError {
        Unprepare = 1 => "failed to unprepare SysEx buffer",
        Prepare = 2 => "failed to prepare SysEx buffer",
        AddBuffer = 3 => "failed to queue SysEx buffer",
    }
}

operation_error! {
    pub enum OutputOpenError {
        Open = 1 => "failed to open output device",
    }
}

operation_error! {
    pub enum OutputCloseError {
        Reset = 1 => "failed to reset output",
        UnprepareBuffer = 2 => "failed to unprepare SysEx buffer",
        Close = 3 => "failed to close output",
    }
}

operation_error! {
    pub enum SendShortError {
        Send = 1 => "failed to send short message",
    }
}

operation_error! {
    pub enum SendSysExError {
        Prepare = 1 => "failed to prepare SysEx buffer",
        Send = 2 => "failed to send SysEx",
    }
}

operation_error! {
    pub enum CompleteSysExError {
        Unprepare = 1 => "failed to unprepare sent SysEx buffer",
    }
}

operation_error! {
    pub enum VirtualOpenError {
        CreateSource = 1 => "failed to create virtual source",
        CreateDestination = 2 => "failed to create virtual destination",
    }
}

operation_error! {
    pub enum VirtualCloseError {
        DisposeSource = 1 => "failed to dispose virtual source",
        DisposeDestination = 2 => "failed to dispose virtual destination",
    }
}

operation_error! {
    pub enum SendBackError {
        Send = 1 => "failed to send data back from virtual device",
    }
}

operation_error! {
    pub enum TickStartError {
        Interval = 1 => "invalid tick interval",
        DeviceCaps = 2 => "failed to read timer capabilities",
        SetTimer = 3 => "failed to set timer callback",
        ThreadStart = 4 => "failed to start tick thread",
    }
}

operation_error! {
    pub enum TickStopError {
        KillEvent = 1 => "failed to kill timer event",
        EndPeriod = 2 => "failed to end timer period",
        Join = 3 => "tick thread panicked",
    }
}

impl From<PrepareBufferError> for RenewBufferError {
    fn from(e: PrepareBufferError) -> Self {
        match e {
            PrepareBufferError::Prepare(cause) => Self::Prepare(cause),
            PrepareBufferError::AddBuffer(cause) => Self::AddBuffer(cause),
        }
    }
}

impl From<UnprepareBufferError> for RenewBufferError {
    fn from(e: UnprepareBufferError) -> Self {
        Self::Unprepare(e.cause())
    }
}

impl From<PrepareBufferError> for InputOpenError {
    fn from(e: PrepareBufferError) -> Self {
        match e {
            PrepareBufferError::Prepare(cause) => Self::PrepareBuffer(cause),
            PrepareBufferError::AddBuffer(cause) => Self::AddBuffer(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique() {
        let all = [
            NativeError::InvalidHandle,
            NativeError::InvalidParameter,
            NativeError::NoMemory,
            NativeError::StillPlaying,
            NativeError::Unprepared,
            NativeError::Allocated,
            NativeError::BadDeviceId,
            NativeError::InvalidFlag,
            NativeError::NoDriver,
            NativeError::NotReady,
            NativeError::BadOpenMode,
            NativeError::InvalidClient,
            NativeError::InvalidPort,
            NativeError::WrongThread,
            NativeError::NotPermitted,
            NativeError::UnknownEndpoint,
            NativeError::WrongEndpointType,
            NativeError::NoConnection,
            NativeError::ServerStart,
            NativeError::MessageSend,
            NativeError::UnknownProperty,
            NativeError::PropertyTooLong,
            NativeError::NoResources,
            NativeError::Unsupported,
            NativeError::Unknown(-1),
        ];
        let mut codes: Vec<i32> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(codes.iter().all(|&c| c > 0 && c < 100));
    }

    #[test]
    fn stage_selects_hundreds() {
        assert_eq!(
            RenewBufferError::Unprepare(NativeError::StillPlaying).result_code(),
            104
        );
        assert_eq!(
            RenewBufferError::AddBuffer(NativeError::InvalidHandle).result_code(),
            301
        );
        let ok: Result<(), SendShortError> = Ok(());
        assert_eq!(ok.result_code(), OK);
    }

    #[test]
    fn prepare_error_keeps_stage_through_renew() {
        let e: RenewBufferError = PrepareBufferError::AddBuffer(NativeError::NoMemory).into();
        assert_eq!(e, RenewBufferError::AddBuffer(NativeError::NoMemory));
        assert_eq!(e.cause(), NativeError::NoMemory);
    }

    #[test]
    fn display_names_the_step() {
        let e = InputCloseError::Close(NativeError::StillPlaying);
        assert_eq!(
            e.to_string(),
            "failed to close input: buffer is still in the driver queue"
        );
    }
}
