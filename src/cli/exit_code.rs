//! Exit code definitions for termshare

use crate::error::Error;

/// Exit codes for the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// General/unspecified error
    GeneralError = 1,
    /// Configuration error (invalid config, missing required flag)
    ConfigError = 2,
    /// Socket error (cannot bind or reach a socket)
    SocketError = 3,
}

impl ExitCode {
    /// Classify a command failure.
    pub fn from_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<Error>() {
            Some(Error::Config(_)) | Some(Error::TomlParse(_)) => ExitCode::ConfigError,
            Some(Error::Admin(_)) | Some(Error::Unreachable(_)) | Some(Error::Io(_)) => {
                ExitCode::SocketError
            }
            _ => ExitCode::GeneralError,
        }
    }
}

impl From<ExitCode> for u8 {
    fn from(code: ExitCode) -> Self {
        code as u8
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}
