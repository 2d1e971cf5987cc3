use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("VXI-11 error {code} during {operation}: {}", describe(.code))]
    Vxi11Error { code: u32, operation: String },

    #[error("RPC error: {message}")]
    RpcError { message: String },

    #[error("RPC call rejected by {program}: {reason}")]
    RpcRejected { program: String, reason: String },

    #[error("Not connected to the scope")]
    NotConnected,

    #[error("VXI-11 instrument not instantiated")]
    NotInstantiated,

    #[error("Unexpected response to '{command}': {response:?}")]
    UnexpectedResponse { command: String, response: String },

    #[error("Invalid binary block: {reason}")]
    InvalidBlock { reason: String },

    #[error("Operation '{operation}' is not supported by the {model} model")]
    Unsupported { operation: String, model: String },

    #[error("Configuration validation failed for {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Instrument,
    Configuration,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// VXI-11 標準錯誤碼（VXI-11 1.0 表 B.2）
pub const VXI11_IO_TIMEOUT: u32 = 15;

fn describe(code: &u32) -> &'static str {
    vxi11_description(*code)
}

pub fn vxi11_description(code: u32) -> &'static str {
    match code {
        0 => "no error",
        1 => "syntax error",
        3 => "device not accessible",
        4 => "invalid link identifier",
        5 => "parameter error",
        6 => "channel not established",
        8 => "operation not supported",
        9 => "out of resources",
        11 => "device locked by another link",
        12 => "no lock held by this link",
        15 => "I/O timeout",
        17 => "I/O error",
        21 => "invalid address",
        23 => "abort",
        29 => "channel already established",
        _ => "unknown error",
    }
}

impl ScopeError {
    pub fn vxi11(code: u32, operation: impl Into<String>) -> Self {
        ScopeError::Vxi11Error {
            code,
            operation: operation.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::vxi11(VXI11_IO_TIMEOUT, operation)
    }

    pub fn rpc(message: impl Into<String>) -> Self {
        ScopeError::RpcError {
            message: message.into(),
        }
    }

    pub fn unexpected(command: impl Into<String>, response: impl Into<String>) -> Self {
        ScopeError::UnexpectedResponse {
            command: command.into(),
            response: response.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ScopeError::Vxi11Error { code, .. } if *code == VXI11_IO_TIMEOUT)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ScopeError::IoError(_) | ScopeError::NotConnected | ScopeError::NotInstantiated => {
                ErrorCategory::Transport
            }
            ScopeError::RpcError { .. } | ScopeError::RpcRejected { .. } => ErrorCategory::Protocol,
            ScopeError::Vxi11Error { .. }
            | ScopeError::UnexpectedResponse { .. }
            | ScopeError::InvalidBlock { .. }
            | ScopeError::Unsupported { .. } => ErrorCategory::Instrument,
            ScopeError::ConfigValidationError { .. }
            | ScopeError::InvalidConfigValueError { .. }
            | ScopeError::MissingConfigError { .. } => ErrorCategory::Configuration,
            ScopeError::CsvError(_) | ScopeError::SerializationError(_) => ErrorCategory::Output,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ScopeError::Unsupported { .. } => ErrorSeverity::Low,
            ScopeError::Vxi11Error { code, .. } if *code == VXI11_IO_TIMEOUT => {
                ErrorSeverity::Medium
            }
            ScopeError::Vxi11Error { code: 11, .. } => ErrorSeverity::Medium,
            ScopeError::IoError(_)
            | ScopeError::RpcError { .. }
            | ScopeError::RpcRejected { .. }
            | ScopeError::NotConnected
            | ScopeError::NotInstantiated => ErrorSeverity::Critical,
            _ => ErrorSeverity::High,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            ScopeError::IoError(_) => "Check that the scope is powered on and reachable on the network",
            ScopeError::Vxi11Error { code, .. } if *code == VXI11_IO_TIMEOUT => {
                "Increase the timeout or check that the acquisition can trigger"
            }
            ScopeError::Vxi11Error { code: 11, .. } => {
                "Another client holds the device lock, close it and retry"
            }
            ScopeError::Vxi11Error { .. } => "Check the command syntax and the scope error queue",
            ScopeError::RpcError { .. } | ScopeError::RpcRejected { .. } => {
                "Make sure the host runs a VXI-11 server (LXI enabled on the scope)"
            }
            ScopeError::NotConnected | ScopeError::NotInstantiated => {
                "Call connect() before talking to the scope"
            }
            ScopeError::UnexpectedResponse { .. } | ScopeError::InvalidBlock { .. } => {
                "Check that the selected model matches the connected scope"
            }
            ScopeError::Unsupported { .. } => "Use a scope model that supports this operation",
            ScopeError::ConfigValidationError { .. }
            | ScopeError::InvalidConfigValueError { .. }
            | ScopeError::MissingConfigError { .. } => "Fix the configuration file or command line flags",
            ScopeError::CsvError(_) | ScopeError::SerializationError(_) => {
                "Check that the output directory is writable"
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Transport => format!("Connection problem: {}", self),
            ErrorCategory::Protocol => format!("Protocol problem: {}", self),
            ErrorCategory::Instrument => format!("Scope reported a problem: {}", self),
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::Output => format!("Could not write the results: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScopeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vxi11_error_display() {
        let err = ScopeError::timeout("wait");
        assert_eq!(err.to_string(), "VXI-11 error 15 during wait: I/O timeout");
        assert!(err.is_timeout());
        assert_eq!(err.severity(), ErrorSeverity::Medium);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ScopeError::NotConnected.category(), ErrorCategory::Transport);
        assert_eq!(ScopeError::rpc("bad").category(), ErrorCategory::Protocol);
        assert_eq!(
            ScopeError::MissingConfigError {
                field: "scope.host".to_string()
            }
            .category(),
            ErrorCategory::Configuration
        );
        assert!(!ScopeError::vxi11(1, "write").is_timeout());
    }
}
