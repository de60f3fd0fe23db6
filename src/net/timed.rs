use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use crate::error::TimedOut;

pin_project_lite::pin_project! {
    /// A future bounded by an optional deadline.
    ///
    /// Every blocking operation of the crate is the corresponding
    /// non-blocking state machine wrapped in a `Timed`. Reaching the
    /// deadline yields [`TimedOut`] and drops no protocol state: the
    /// buffers live on the connection, so the wait can be retried.
    pub struct Timed<F> {
        #[pin]
        future: F,
        #[pin]
        sleep: Option<tokio::time::Sleep>,
    }
}

/// Bound `future` by `timeout`, where [`None`] means eternity.
pub fn timed<F: Future>(timeout: Option<Duration>, future: F) -> Timed<F> {
    Timed {
        future,
        sleep: timeout.map(tokio::time::sleep),
    }
}

impl<F: Future> Future for Timed<F> {
    type Output = Result<F::Output, TimedOut>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(output) = this.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }

        if let Some(sleep) = this.sleep.as_pin_mut() {
            if sleep.poll(cx).is_ready() {
                return Poll::Ready(Err(TimedOut));
            }
        }

        Poll::Pending
    }
}
