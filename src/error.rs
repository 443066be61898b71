// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types for connection operations.
//!
//! Discovery, connect and send raise these to the caller. Disconnect,
//! background reconnection and frame parsing log them and carry on.

use thiserror::Error;

/// Errors raised by the connection core.
#[derive(Error, Debug)]
pub enum ChatError {
    /// A required Bluetooth capability was denied.
    #[error("Bluetooth permissions were not granted")]
    PermissionDenied,

    /// The radio is off and could not be turned on.
    #[error("Bluetooth is disabled and could not be enabled")]
    RadioDisabled,

    /// Transport-level connect failure.
    #[error("Failed to connect to {device}: {reason}")]
    Connection {
        /// Address of the device we tried to reach
        device: String,
        /// Failure reason
        reason: String,
    },

    /// Operation needs an active session and there is none.
    #[error("No device connected")]
    NotConnected,

    /// Incoming payload could not be parsed into a frame.
    #[error("Malformed frame: {0}")]
    FrameParse(String),

    /// Message text exceeds the configured bound.
    #[error("Message too long: {len} bytes exceeds maximum of {max} bytes")]
    MessageTooLong {
        /// Actual text size
        len: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Adapter call failed outside of connect.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ChatError {
    /// Check if the user can reasonably retry the operation.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ChatError::Connection { .. } | ChatError::Transport(_) | ChatError::NotConnected
        )
    }

    /// Get an error code for logging.
    pub fn error_code(&self) -> &'static str {
        match self {
            ChatError::PermissionDenied => "PERMISSION_DENIED",
            ChatError::RadioDisabled => "RADIO_DISABLED",
            ChatError::Connection { .. } => "CONNECTION_FAILED",
            ChatError::NotConnected => "NOT_CONNECTED",
            ChatError::FrameParse(_) => "FRAME_PARSE",
            ChatError::MessageTooLong { .. } => "MESSAGE_TOO_LONG",
            ChatError::Transport(_) => "TRANSPORT_ERROR",
        }
    }

    pub(crate) fn transport(err: anyhow::Error) -> Self {
        ChatError::Transport(format!("{:#}", err))
    }
}

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ChatError::NotConnected.error_code(), "NOT_CONNECTED");
        assert_eq!(ChatError::RadioDisabled.error_code(), "RADIO_DISABLED");
    }

    #[test]
    fn test_is_retriable() {
        let err = ChatError::Connection {
            device: "00:11:22:33:44:55".to_string(),
            reason: "host is down".to_string(),
        };
        assert!(err.is_retriable());
        assert!(!ChatError::PermissionDenied.is_retriable());
        assert!(!ChatError::FrameParse("eof".to_string()).is_retriable());
    }

    #[test]
    fn test_connection_message() {
        let err = ChatError::Connection {
            device: "00:11:22:33:44:55".to_string(),
            reason: "host is down".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("00:11:22:33:44:55"));
        assert!(text.contains("host is down"));
    }
}
