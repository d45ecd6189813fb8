/// Timing and window parameters, fixed at endpoint construction.
#[derive(Debug, Clone)]
pub struct Params {
    /// Base period, in milliseconds, pacing heartbeats and retransmission
    /// backoff.
    pub epoch_millis: u64,
    /// Number of silent epochs after which a connection is declared dropped.
    pub epoch_limit: u32,
    /// Maximum number of unacknowledged outbound data messages per
    /// connection.
    pub window_size: usize,
    /// Cap, in epochs, on the exponential retransmission backoff. Zero means
    /// every unacknowledged message is retransmitted each epoch.
    pub max_backoff_interval: u32,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            epoch_millis: 2000,
            epoch_limit: 5,
            window_size: 1,
            max_backoff_interval: 0,
        }
    }
}
