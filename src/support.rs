use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Poll `probe` at a fixed interval until it reports success or the
/// deadline elapses. Returns whether the probe ever succeeded.
///
/// Replaces open-ended interval timers around "wait for the handle to
/// appear" situations with a bounded, definite answer.
pub async fn poll_until<F>(interval: Duration, deadline: Duration, mut probe: F) -> bool
where
    F: FnMut() -> bool,
{
    let give_up = Instant::now() + deadline;
    loop {
        if probe() {
            return true;
        }
        if Instant::now() >= give_up {
            return false;
        }
        sleep(interval).await;
    }
}
