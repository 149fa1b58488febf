//! Registry errors.

use std::os::fd::RawFd;

use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Registry has reached its configured capacity
    #[error("Registry is full (max: {max})")]
    RegistryFull { max: usize },

    /// Another live connection already owns this descriptor
    #[error("Descriptor {fd} is already registered")]
    DuplicateDescriptor { fd: RawFd },
}
