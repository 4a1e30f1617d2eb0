// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! VMCI status codes and the queue pair error type.

use std::fmt::Debug;
use std::num::NonZeroI32;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A VMCI status code, as returned by the device and the event bus.
///
/// Negative values are errors, see [`VmciError`]. Zero and positive values
/// are success codes.
#[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
#[repr(transparent)]
pub struct VmciStatus(pub i32);

impl VmciStatus {
    pub const SUCCESS: Self = Self(0);
    pub const SUCCESS_QUEUEPAIR_CREATE: Self = Self(4);
    pub const SUCCESS_QUEUEPAIR_ATTACH: Self = Self(5);

    /// Returns `Ok(())` for any success code, otherwise `Err(err)` where `err`
    /// is the corresponding [`VmciError`].
    pub fn result(self) -> Result<(), VmciError> {
        match NonZeroI32::new(self.0) {
            Some(err) if err.get() < 0 => Err(VmciError(err)),
            _ => Ok(()),
        }
    }

    pub fn is_ok(self) -> bool {
        self.0 >= 0
    }
}

impl From<Result<(), VmciError>> for VmciStatus {
    fn from(result: Result<(), VmciError>) -> Self {
        result.err().map_or(Self::SUCCESS, |err| Self(err.0.get()))
    }
}

impl From<Result<(), Error>> for VmciStatus {
    fn from(result: Result<(), Error>) -> Self {
        result.map_err(|err| err.status()).into()
    }
}

impl Debug for VmciStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.result() {
            Ok(()) => write!(f, "Success({})", self.0),
            Err(err) => Debug::fmt(&err, f),
        }
    }
}

/// A [`VmciStatus`] value representing an error.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct VmciError(NonZeroI32);

impl VmciError {
    /// The raw status code.
    pub fn code(&self) -> i32 {
        self.0.get()
    }
}

impl Debug for VmciError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.debug_name() {
            Some(name) => f.pad(name),
            None => Debug::fmt(&self.0.get(), f),
        }
    }
}

impl std::fmt::Display for VmciError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.doc_str() {
            Some(s) => f.write_str(s),
            None => write!(f, "VMCI error {}", self.0),
        }
    }
}

impl std::error::Error for VmciError {}

macro_rules! vmci_error {
    ($ty:ty, $(#[doc = $doc:expr] $ident:ident = $val:literal),* $(,)?) => {
        impl $ty {
            $(
                #[doc = $doc]
                pub const $ident: Self = Self(NonZeroI32::new($val).unwrap());
            )*

            fn debug_name(&self) -> Option<&'static str> {
                Some(match self.0.get() {
                    $(
                        $val => stringify!($ident),
                    )*
                    _ => return None,
                })
            }

            fn doc_str(&self) -> Option<&'static str> {
                Some(match self.0.get() {
                    $(
                        $val => $doc,
                    )*
                    _ => return None,
                })
            }
        }
    };
}

// DEVNOTE: the doc comments here are also used as the runtime error strings.
vmci_error! {
    VmciError,
    /// Invalid resource
    INVALID_RESOURCE = -1,
    /// Invalid arguments
    INVALID_ARGS = -2,
    /// Out of memory
    NO_MEM = -3,
    /// Datagram delivery failed
    DATAGRAM_FAILED = -4,
    /// Access denied
    NO_ACCESS = -7,
    /// No handle available
    NO_HANDLE = -8,
    /// Duplicate entry
    DUPLICATE_ENTRY = -9,
    /// Destination unreachable
    DST_UNREACHABLE = -10,
    /// Generic failure
    GENERIC = -13,
    /// No resources
    NO_RESOURCES = -19,
    /// Resource unavailable
    UNAVAILABLE = -20,
    /// Not found
    NOT_FOUND = -21,
    /// Already exists
    ALREADY_EXISTS = -22,
    /// Invalid size
    INVALID_SIZE = -24,
    /// Timed out
    TIMEOUT = -26,
    /// Queue pair parameters mismatch
    QUEUEPAIR_MISMATCH = -31,
    /// Device not found
    DEVICE_NOT_FOUND = -39,
}

/// Errors returned by queue pair operations.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Malformed request: bad sizes, unknown flags or an invalid handle.
    #[error("invalid arguments")]
    InvalidArgs,
    /// Queue memory, page descriptors or resource ids could not be allocated.
    #[error("out of memory")]
    NoMemory,
    /// A non-local queue pair with this handle already exists.
    #[error("queue pair already exists")]
    AlreadyExists,
    #[error("queue pair not found")]
    NotFound,
    /// The queue pair cannot be created or attached in the current state.
    #[error("queue pair unavailable")]
    Unavailable,
    /// A local attach did not mirror the creator's sizes or flags.
    #[error("queue pair parameters do not match")]
    QueuePairMismatch,
    #[error("access denied")]
    NoAccess,
    /// The VMCI device is gone or shutting down.
    #[error("vmci device not found")]
    DeviceNotFound,
    /// Any other failure reported by the device or the event bus.
    #[error("vmci request failed")]
    Status(#[source] VmciError),
}

const WELL_KNOWN_ERRORS: [(VmciError, Error); 8] = [
    (VmciError::INVALID_ARGS, Error::InvalidArgs),
    (VmciError::NO_MEM, Error::NoMemory),
    (VmciError::ALREADY_EXISTS, Error::AlreadyExists),
    (VmciError::NOT_FOUND, Error::NotFound),
    (VmciError::UNAVAILABLE, Error::Unavailable),
    (VmciError::QUEUEPAIR_MISMATCH, Error::QueuePairMismatch),
    (VmciError::NO_ACCESS, Error::NoAccess),
    (VmciError::DEVICE_NOT_FOUND, Error::DeviceNotFound),
];

impl Error {
    /// The status code reported for this error at the VMCI API boundary.
    pub fn status(&self) -> VmciError {
        if let Error::Status(err) = *self {
            return err;
        }
        WELL_KNOWN_ERRORS
            .iter()
            .find(|(_, e)| e == self)
            .map(|(code, _)| *code)
            .expect("every taxonomy error has a status code")
    }
}

impl From<VmciError> for Error {
    fn from(err: VmciError) -> Self {
        WELL_KNOWN_ERRORS
            .iter()
            .find(|(code, _)| *code == err)
            .map_or(Error::Status(err), |(_, e)| *e)
    }
}
