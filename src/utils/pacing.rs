//! Tick pacing for polling loops.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a paced operation. An idle outcome means there was nothing to
/// process, so the caller should wait out the remainder of the tick.
pub trait TickOutcome {
    fn is_idle(&self) -> bool;
}

impl TickOutcome for bool {
    fn is_idle(&self) -> bool {
        !*self
    }
}

impl<T> TickOutcome for Option<T> {
    fn is_idle(&self) -> bool {
        self.is_none()
    }
}

impl<T> TickOutcome for Vec<T> {
    fn is_idle(&self) -> bool {
        self.is_empty()
    }
}

impl TickOutcome for String {
    fn is_idle(&self) -> bool {
        self.is_empty()
    }
}

// 錯誤直接回傳，不等待
impl<T: TickOutcome, E> TickOutcome for Result<T, E> {
    fn is_idle(&self) -> bool {
        match self {
            Ok(value) => value.is_idle(),
            Err(_) => false,
        }
    }
}

/// Run `op`; if its outcome is idle, sleep until `tick` has elapsed since the start.
pub async fn tick_control<F, Fut, T>(tick: Duration, op: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
    T: TickOutcome,
{
    let start = Instant::now();
    let value = op().await;
    if value.is_idle() {
        let deadline = start + tick;
        if deadline > Instant::now() {
            tokio::time::sleep_until(deadline).await;
        }
    }
    value
}
