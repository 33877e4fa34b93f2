use thiserror::Error;

/// Errors produced by the DGT3000 protocol engine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DgtError {
    #[error("bus initialization failed")]
    I2cInit,
    #[error("bus communication error")]
    I2cComm,
    #[error("timeout")]
    Timeout,
    #[error("no acknowledgment")]
    NoAck,
    #[error("receive buffer overrun")]
    BufferOverrun,
    #[error("CRC check failed")]
    Crc,
    #[error("clock is off")]
    ClockOff,
    #[error("not configured")]
    NotConfigured,
    #[error("initialization failed after recovery")]
    InitFailed,
}

impl DgtError {
    /// Errors that imply the clock connection is gone. Any operation that
    /// fails with one of these drops the engine back to disconnected and
    /// unconfigured until recovery runs the handshake again.
    pub fn is_connection_affecting(self) -> bool {
        matches!(
            self,
            DgtError::I2cComm
                | DgtError::Timeout
                | DgtError::NoAck
                | DgtError::ClockOff
                | DgtError::Crc
                | DgtError::NotConfigured
        )
    }
}

/// System-level error codes reported back to the host in responses and
/// error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemErrorCode {
    Success,
    CommunicationError,
    NotConfigured,
    CrcError,
    NotConnected,
    JsonParseError,
    InvalidCommand,
    InvalidParameters,
    CommandTimeout,
    Unknown,
}

impl SystemErrorCode {
    pub fn code(self) -> u16 {
        match self {
            SystemErrorCode::Success => 0,
            SystemErrorCode::CommunicationError => 100,
            SystemErrorCode::NotConfigured => 101,
            SystemErrorCode::CrcError => 102,
            SystemErrorCode::NotConnected => 103,
            SystemErrorCode::JsonParseError => 200,
            SystemErrorCode::InvalidCommand => 201,
            SystemErrorCode::InvalidParameters => 202,
            SystemErrorCode::CommandTimeout => 300,
            SystemErrorCode::Unknown => 999,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SystemErrorCode::Success => "Success",
            SystemErrorCode::CommunicationError => "Bus communication error",
            SystemErrorCode::NotConfigured => "DGT3000 not configured",
            SystemErrorCode::CrcError => "CRC error",
            SystemErrorCode::NotConnected => "DGT3000 not connected",
            SystemErrorCode::JsonParseError => "JSON parse error",
            SystemErrorCode::InvalidCommand => "Invalid command",
            SystemErrorCode::InvalidParameters => "Invalid parameters",
            SystemErrorCode::CommandTimeout => "Command timeout",
            SystemErrorCode::Unknown => "Unknown error",
        }
    }
}

/// Deterministic engine-error to system-error mapping.
pub fn map_dgt_error(err: DgtError) -> SystemErrorCode {
    match err {
        DgtError::I2cComm | DgtError::I2cInit => SystemErrorCode::CommunicationError,
        DgtError::Timeout | DgtError::NoAck => SystemErrorCode::CommandTimeout,
        DgtError::NotConfigured => SystemErrorCode::NotConfigured,
        DgtError::Crc => SystemErrorCode::CrcError,
        DgtError::ClockOff => SystemErrorCode::NotConnected,
        DgtError::BufferOverrun | DgtError::InitFailed => SystemErrorCode::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_deterministic() {
        assert_eq!(map_dgt_error(DgtError::I2cComm), SystemErrorCode::CommunicationError);
        assert_eq!(map_dgt_error(DgtError::I2cInit), SystemErrorCode::CommunicationError);
        assert_eq!(map_dgt_error(DgtError::Timeout), SystemErrorCode::CommandTimeout);
        assert_eq!(map_dgt_error(DgtError::NoAck), SystemErrorCode::CommandTimeout);
        assert_eq!(map_dgt_error(DgtError::NotConfigured), SystemErrorCode::NotConfigured);
        assert_eq!(map_dgt_error(DgtError::Crc), SystemErrorCode::CrcError);
        assert_eq!(map_dgt_error(DgtError::ClockOff), SystemErrorCode::NotConnected);
        assert_eq!(map_dgt_error(DgtError::BufferOverrun), SystemErrorCode::Unknown);
    }

    #[test]
    fn codes_and_names_are_stable() {
        assert_eq!(SystemErrorCode::Success.code(), 0);
        assert_eq!(SystemErrorCode::InvalidParameters.code(), 202);
        assert_eq!(SystemErrorCode::NotConfigured.as_str(), "DGT3000 not configured");
        assert_eq!(SystemErrorCode::CommandTimeout.as_str(), "Command timeout");
    }

    #[test]
    fn connection_affecting_classification() {
        assert!(DgtError::NoAck.is_connection_affecting());
        assert!(DgtError::Crc.is_connection_affecting());
        assert!(DgtError::ClockOff.is_connection_affecting());
        assert!(!DgtError::I2cInit.is_connection_affecting());
        assert!(!DgtError::BufferOverrun.is_connection_affecting());
    }
}
