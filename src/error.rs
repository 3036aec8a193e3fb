//! The crate's two error taxonomies (spec §7): a wire-level [`ErrorKind`] used
//! throughout the public API, plus the controller [`HciStatus`] and pairing
//! [`SmpReason`] code sets preserved verbatim from the controller/peer so
//! callers can distinguish retryable from fatal conditions.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            message: String::new(),
        }
    }
}

/// Top-level error classification returned by every public API (spec §7 "User-visible").
#[derive(Debug, displaydoc::Display, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// an unknown error occurred
    Unknown,
    /// invalid parameters for Bluetooth operation
    InvalidParameters,
    /// invalid handle for Bluetooth operation
    InvalidHandle,
    /// the Bluetooth device isn't connected
    NotConnected,
    /// the Bluetooth adapter isn't powered
    NotPowered,
    /// Bluetooth operation was cancelled
    OperationCancelled,
    /// Bluetooth operation timed out
    Timeout,
    /// Bluetooth device disconnected
    PeripheralDisconnected,
    /// the provided UUID is not allowed
    UuidNotAllowed,
    /// the Bluetooth connection failed
    ConnectionFailed,
    /// another connection attempt is already in flight on this adapter
    ConnectionGateBusy,
    /// the Bluetooth device is unknown
    UnknownDevice,
    /// the Bluetooth operation is unsupported
    OperationNotSupported,
    /// pairing is already in progress
    AlreadyPairing,
    /// no pairing is in progress
    NotPairing,
    /// the Bluetooth adapter is already scanning
    AlreadyScanning,
    /// the received frame was malformed or truncated
    MalformedPdu,
    /// the transport's reply ring is full
    ReplyRingFull,
    /// an I/O error occurred on a socket: {0}
    Io(String),
    /// the controller returned status {0:?}
    Controller(HciStatus),
    /// pairing failed: {0:?}
    Pairing(SmpReason),
    /// internal error
    InternalError,
}

/// Controller status codes, Bluetooth Core Specification Vol 2, Part D.
///
/// Preserved verbatim from command-complete/command-status events and from
/// disconnect reasons so the caller can distinguish retryable conditions
/// (e.g. `Timeout`) from fatal ones (e.g. `NotPowered`).
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum HciStatus {
    /// success
    Success,
    /// unknown HCI command
    UnknownCommand,
    /// unknown connection identifier
    UnknownConnectionIdentifier,
    /// authentication failure
    AuthenticationFailure,
    /// PIN or key missing
    PinOrKeyMissing,
    /// the remote device is not paired
    NotPaired,
    /// the remote device is already paired
    AlreadyPaired,
    /// command disallowed in the controller's current state
    CommandDisallowed,
    /// the remote user terminated the connection
    RemoteUserTerminated,
    /// the remote device powered off
    RemotePowerOff,
    /// unacceptable connection parameters
    UnacceptableConnectionParam,
    /// the adapter is not powered
    NotPowered,
    /// controller internal failure
    InternalFailure,
    /// the command timed out
    Timeout,
    /// the requested operation is not supported
    NotSupported,
    /// the operation failed
    Failed,
    /// an unspecified error occurred
    UnspecifiedError,
    /// invalid HCI command parameters
    InvalidParams,
    /// an unrecognized controller status code: {0}
    Other(u8),
}

impl From<u8> for HciStatus {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::Success,
            0x01 => Self::UnknownCommand,
            0x02 => Self::UnknownConnectionIdentifier,
            0x05 => Self::AuthenticationFailure,
            0x06 => Self::PinOrKeyMissing,
            0x09 => Self::CommandDisallowed, // placeholder for controllers reusing 0x09 as "resources"
            0x0c => Self::CommandDisallowed,
            0x13 => Self::RemoteUserTerminated,
            0x15 => Self::RemotePowerOff,
            0x1e => Self::UnacceptableConnectionParam,
            0x22 => Self::Timeout,
            0x1f => Self::UnspecifiedError,
            0x10 => Self::NotPaired,
            0x11 => Self::AlreadyPaired,
            0x03 => Self::InternalFailure,
            0x20 => Self::NotSupported,
            0x12 => Self::InvalidParams,
            _ => Self::Other(code),
        }
    }
}

/// SMP pairing failure reasons, Bluetooth Core Specification Vol 3, Part H, §3.5.5.
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SmpReason {
    /// passkey entry failed
    PasskeyEntryFailed,
    /// out-of-band data is not available
    OobNotAvailable,
    /// authentication requirements cannot be met
    AuthenticationRequirements,
    /// confirm value failed to match
    ConfirmValueFailed,
    /// pairing is not supported by this device
    PairingNotSupported,
    /// the encryption key size is insufficient
    EncryptionKeySize,
    /// an unrecognized or unsupported SMP command was received
    CommandNotSupported,
    /// unspecified reason
    UnspecifiedReason,
    /// too many repeated pairing attempts
    RepeatedAttempts,
    /// invalid parameters in an SMP PDU
    InvalidParameters,
    /// DHKey check failed
    DHKeyCheckFailed,
    /// numeric comparison failed
    NumericComparisonFailed,
    /// BR/EDR pairing is in progress
    BrEdrPairingInProgress,
    /// cross-transport key derivation/generation is not allowed
    CrossTransportKeyDerivationNotAllowed,
    /// an unrecognized SMP failure reason: {0}
    Other(u8),
}

impl From<u8> for SmpReason {
    fn from(code: u8) -> Self {
        match code {
            0x01 => Self::PasskeyEntryFailed,
            0x02 => Self::OobNotAvailable,
            0x03 => Self::AuthenticationRequirements,
            0x04 => Self::ConfirmValueFailed,
            0x05 => Self::PairingNotSupported,
            0x06 => Self::EncryptionKeySize,
            0x07 => Self::CommandNotSupported,
            0x08 => Self::UnspecifiedReason,
            0x09 => Self::RepeatedAttempts,
            0x0a => Self::InvalidParameters,
            0x0b => Self::DHKeyCheckFailed,
            0x0c => Self::NumericComparisonFailed,
            0x0d => Self::BrEdrPairingInProgress,
            0x0e => Self::CrossTransportKeyDerivationNotAllowed,
            other => Self::Other(other),
        }
    }
}

/// ATT protocol error codes, Bluetooth Core Specification Vol 3, Part F, §3.4.1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttError {
    Success,
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientEncryptionKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    DatabaseOutOfSync,
    ValueNotAllowed,
    Application(u8),
    Common(u8),
    Reserved(u8),
}

impl From<u8> for AttError {
    fn from(number: u8) -> Self {
        match number {
            0x00 => Self::Success,
            0x01 => Self::InvalidHandle,
            0x02 => Self::ReadNotPermitted,
            0x03 => Self::WriteNotPermitted,
            0x04 => Self::InvalidPdu,
            0x05 => Self::InsufficientAuthentication,
            0x06 => Self::RequestNotSupported,
            0x07 => Self::InvalidOffset,
            0x08 => Self::InsufficientAuthorization,
            0x09 => Self::PrepareQueueFull,
            0x0a => Self::AttributeNotFound,
            0x0b => Self::AttributeNotLong,
            0x0c => Self::InsufficientEncryptionKeySize,
            0x0d => Self::InvalidAttributeValueLength,
            0x0e => Self::UnlikelyError,
            0x0f => Self::InsufficientEncryption,
            0x10 => Self::UnsupportedGroupType,
            0x11 => Self::InsufficientResources,
            0x12 => Self::DatabaseOutOfSync,
            0x13 => Self::ValueNotAllowed,
            0x80..=0x9f => Self::Application(number),
            0xe0..=0xff => Self::Common(number),
            _ => Self::Reserved(number),
        }
    }
}

impl From<AttError> for Error {
    fn from(att: AttError) -> Self {
        let kind = match att {
            AttError::Success => ErrorKind::InternalError,
            AttError::InvalidHandle => ErrorKind::InvalidHandle,
            AttError::AttributeNotFound => ErrorKind::InvalidHandle,
            AttError::InvalidPdu => ErrorKind::MalformedPdu,
            _ => ErrorKind::OperationNotSupported,
        };
        Error::new(kind, format!("{att:?}"))
    }
}
