use core::time::Duration;

/// timeout and keep-alive knobs for a client.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// socket connect including tls handshake. default 10 seconds.
    pub connect_timeout: Duration,
    /// request write to first response head byte. default 30 seconds.
    pub headers_timeout: Duration,
    /// gap between response body chunks. default 30 seconds.
    pub body_timeout: Duration,
    /// idle timeout when the server advertises none. default 4 seconds.
    pub keep_alive_timeout: Duration,
    /// upper clamp on a server advertised idle timeout. default 10 minutes.
    pub keep_alive_max_timeout: Duration,
    /// safety margin subtracted from a server advertised idle timeout.
    /// default 1 second.
    pub keep_alive_timeout_threshold: Duration,
}

impl TimeoutConfig {
    pub const fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            headers_timeout: Duration::from_secs(30),
            body_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(4),
            keep_alive_max_timeout: Duration::from_secs(600),
            keep_alive_timeout_threshold: Duration::from_secs(1),
        }
    }

    /// idle timeout derived from a server `keep-alive: timeout=N` hint,
    /// clamped and reduced by the safety threshold. `None` means the hint is
    /// too small to be usable and the connection should be marked reset.
    pub(crate) fn negotiated_idle(&self, hint: Duration) -> Option<Duration> {
        let clamped = hint.min(self.keep_alive_max_timeout);
        let reduced = clamped.saturating_sub(self.keep_alive_timeout_threshold);
        if reduced.is_zero() { None } else { Some(reduced) }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// the single reusable timer per client holds one phase at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerPhase {
    None,
    Connect,
    Headers,
    Body,
    Idle,
    /// reconnect backoff while disconnected with queued requests.
    Retry,
}
