//! Readiness multiplexing over a [`ConnectionTable`].
//!
//! Each connection declares a single [`Interest`]. [`select`] resolves as soon
//! as at least one connection is ready for what it declared, reporting every
//! connection ready at that moment. A connection with no pending work sits in
//! [`Interest::Idle`] and is not polled at all.

use crate::connection::{ConnectionId, ConnectionTable};
use std::future::poll_fn;
use std::task::Poll;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    /// Waiting on work running elsewhere; an update will arrive through the
    /// registration queue.
    Idle,
}

/// Waits until some connections are ready. Pends forever on an empty or
/// fully idle table, so callers race it against other events or a timeout.
pub async fn select(connections: &ConnectionTable) -> Vec<(ConnectionId, Interest)> {
    let watched: Vec<_> = connections
        .iter()
        .filter(|c| c.interest != Interest::Idle)
        .collect();

    poll_fn(|cx| {
        let ready: Vec<(ConnectionId, Interest)> = watched
            .iter()
            .filter(|c| {
                let poll = match c.interest {
                    Interest::Read => c.stream.poll_read_ready(cx),
                    Interest::Write => c.stream.poll_write_ready(cx),
                    Interest::Idle => return false,
                };
                // Errors count as ready: the following read or write reports them
                poll.is_ready()
            })
            .map(|c| (c.id, c.interest))
            .collect();

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    })
    .await
}
