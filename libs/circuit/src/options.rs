use std::time::Duration;

/// Deadline applied to requests that do not set their own
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_millis(60_000);

/// Per-call settings for [`Circuit::request`](crate::Circuit::request)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Falls back to the circuit's configured TTL when unset
    pub ttl: Option<Duration>,
}

impl RequestOptions {
    /// Options with an explicit request deadline
    pub fn ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// Per-responder settings for [`Circuit::respond`](crate::Circuit::respond)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RespondOptions {
    /// Maximum handler invocations running at once; `None` or `Some(0)`
    /// means unbounded
    pub concurrency: Option<usize>,
}

impl RespondOptions {
    /// Options admitting at most `limit` concurrent handler calls
    pub fn concurrency(limit: usize) -> Self {
        Self {
            concurrency: Some(limit),
        }
    }

    pub(crate) fn limit(&self) -> Option<usize> {
        self.concurrency.filter(|&limit| limit > 0)
    }
}
