use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the service core.
///
/// The libvirt hook handlers (Prepare/Release) catch these at the D-Bus
/// boundary, log them, and report failure to libvirt instead of propagating.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested source path does not exist or is not a character device.
    #[error("no such input device: {0}")]
    NotADevice(PathBuf),

    /// A guest device path did not carry the expected "{vm}-" basename prefix.
    #[error("device path {path} is not prefixed with VM name {vm}")]
    BadDevicePath { path: String, vm: String },

    /// A Release referenced a source device the service never replicated.
    #[error("unmanaged source device: {0}")]
    UnmanagedDevice(PathBuf),

    /// The domain XML handed over by the libvirt hook could not be parsed.
    #[error("malformed domain XML: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
