use thiserror::Error;

/// Errors surfaced by the transmit engine.
#[derive(Debug, Error)]
pub enum TxError {
    /// The raw I/O handle could not be acquired; the engine is left inert.
    #[error("failed to open device {device}: {source}")]
    DeviceOpen {
        device: String,
        #[source]
        source: std::io::Error,
    },
    /// The sink rejected a packet; the current run aborts. Transient errors
    /// are not retried, the engine is a mechanical player.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Stop was requested mid-run.
    #[error("transmit cancelled")]
    Cancelled,
    /// Start while already running, mode switch while running, and similar.
    #[error("{0}")]
    Misconfiguration(&'static str),
}
