//! Common utilities

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::time::{Instant, Sleep};

#[derive(Debug)]
pub(crate) enum Running {
    Continue,
    Stop,
}

/// Resolves once nothing has reset it for `duration`
#[derive(Debug)]
pub(crate) struct IdleTimeout {
    delay: Pin<Box<Sleep>>,
    duration: Duration,
}

impl IdleTimeout {
    pub fn new(duration: Duration) -> Self {
        let delay = Box::pin(tokio::time::sleep(duration));
        Self { delay, duration }
    }

    pub fn reset(&mut self) {
        let next = Instant::now() + self.duration;
        self.delay.as_mut().reset(next);
    }
}

impl Future for IdleTimeout {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.delay.as_mut().poll(cx)
    }
}

/// Picks the negotiated value of a tuning parameter where 0 means "no limit"
pub(crate) fn negotiate<T>(client: T, server: T) -> T
where
    T: Ord + Default + Copy,
{
    let zero = T::default();
    match (client == zero, server == zero) {
        (true, _) => server,
        (_, true) => client,
        _ => std::cmp::min(client, server),
    }
}

#[cfg(test)]
mod tests {
    use super::negotiate;

    #[test]
    fn zero_means_no_limit() {
        assert_eq!(negotiate(0u16, 60), 60);
        assert_eq!(negotiate(30u16, 0), 30);
        assert_eq!(negotiate(0u16, 0), 0);
        assert_eq!(negotiate(131_072u32, 4096), 4096);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_is_pushed_back_by_reset() {
        use std::time::Duration;
        use tokio::time::{advance, timeout};

        let mut idle = super::IdleTimeout::new(Duration::from_secs(10));
        advance(Duration::from_secs(8)).await;
        idle.reset();
        advance(Duration::from_secs(8)).await;
        assert!(timeout(Duration::from_millis(1), &mut idle).await.is_err());
        advance(Duration::from_secs(3)).await;
        idle.await;
    }
}
