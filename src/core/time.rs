use std::time::Duration;
use tokio::time::Instant;

/// Clock abstraction so keepalive deadlines stay testable and replayable.
/// Built on the runtime clock, so paused-time tests drive deadlines
/// deterministically.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> tokio::time::Sleep;

    /// Deadline for a keepalive window: the broker grants the client 1.5x
    /// its advertised interval before declaring the session dead.
    fn keepalive_deadline(&self, last_seen: Instant, keep_alive_secs: u16) -> Option<Instant> {
        if keep_alive_secs == 0 {
            return None;
        }
        Some(last_seen + Duration::from_millis(u64::from(keep_alive_secs) * 1500))
    }
}

/// Runtime-backed clock used outside of tests.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        tokio::time::sleep(duration)
    }
}
