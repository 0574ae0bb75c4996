use std::time::Duration;

/// Everything that can go wrong between opening the bus and handing back a device record.
///
/// [`Error::Connect`], [`Error::LockTimeout`] and [`Error::ReadTimeout`] are fatal for the process,
/// see [`Error::is_fatal`].
/// The others end the current polling cycle for one device only.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open {target} within {timeout:?}: {source}")]
    Connect {
        target: String,
        timeout: Duration,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?} waiting for the bus, the transport looks wedged")]
    LockTimeout(Duration),

    #[error("no response within {0:?}, the device looks wedged")]
    ReadTimeout(Duration),

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("unit {unit} answered with modbus exception: {reason}")]
    Exception { unit: u8, reason: String },

    #[error("register {register} (+{span}) is outside of block {start}..{end}")]
    OutOfRange {
        register: u16,
        span: u16,
        start: u16,
        end: u16,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Fatal errors mean the process must stop and let its supervisor restart it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::LockTimeout(_) | Self::ReadTimeout(_)
        )
    }

    /// Reclassifies an I/O timeout of a transport with read timeout `timeout` as [`Error::ReadTimeout`].
    pub(crate) fn timed_out_after(self, timeout: Duration) -> Self {
        match self {
            Self::Transport(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Self::ReadTimeout(timeout)
            }
            other => other,
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::Transport(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.into(),
        ))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
