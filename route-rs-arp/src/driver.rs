use crate::engine::ArpEngine;
use futures::Stream;
use route_rs_packets::ArpFrame;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{self, Interval};
use tracing::debug;

/// Frames ingested per poll before the driver yields back to the runtime.
const INGEST_BATCH: usize = 64;

/// Runs an `ArpEngine`: ingests every frame `inbound` yields and ticks the retry timer every
/// `tick_interval`. Completes once `inbound` ends, failing whatever is still in flight.
pub struct ArpDriver<S> {
    engine: ArpEngine,
    inbound: S,
    tick_interval: Duration,
    ticker: Option<Interval>,
}

impl<S> ArpDriver<S>
where
    S: Stream<Item = ArpFrame> + Unpin,
{
    pub(crate) fn new(engine: ArpEngine, inbound: S, tick_interval: Duration) -> Self {
        ArpDriver {
            engine,
            inbound,
            tick_interval,
            ticker: None,
        }
    }
}

impl<S> Future for ArpDriver<S>
where
    S: Stream<Item = ArpFrame> + Unpin,
{
    type Output = ();

    /// Implement Poll for Future for ArpDriver
    ///
    /// #1 `inbound` has frames: ingest up to a batch of them. If the batch runs out first, wake
    /// ourselves so the rest are picked up after other tasks had a turn.
    ///
    /// #2 `inbound` ended: nothing can be answered anymore. Shut the engine down and complete.
    ///
    /// #3 The ticker fired: let the resolver retransmit or expire requests, as often as it fired.
    ///
    /// The ticker is created on first poll so the driver can be built outside a runtime.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let mut ingested = 0;
        loop {
            if ingested == INGEST_BATCH {
                cx.waker().wake_by_ref();
                break;
            }
            match Pin::new(&mut this.inbound).poll_next(cx) {
                Poll::Ready(Some(frame)) => {
                    this.engine.ingest(&frame);
                    ingested += 1;
                }
                Poll::Ready(None) => {
                    let aborted = this.engine.shutdown();
                    debug!(aborted, "ARP inbound stream ended");
                    return Poll::Ready(());
                }
                Poll::Pending => break,
            }
        }

        let tick_interval = this.tick_interval;
        let ticker = this
            .ticker
            .get_or_insert_with(|| time::interval(tick_interval));
        while ticker.poll_tick(cx).is_ready() {
            this.engine.tick();
        }

        Poll::Pending
    }
}
