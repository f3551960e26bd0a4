use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::piece::PieceProgress;

#[derive(Debug, Default)]
struct QueueState {
    pieces: VecDeque<PieceProgress>,
    closed: bool,
}

/// Pieces that still have to be downloaded, shared by all peer connections.
///
/// A connection takes the first piece its peer has and hasn't sent corrupted before. Pieces come
/// back through [`WorkQueue::push`] when a connection fails or a piece doesn't pass verification.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(pieces: impl IntoIterator<Item = PieceProgress>) -> Self {
        WorkQueue {
            state: Mutex::new(QueueState {
                pieces: pieces.into_iter().collect(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a piece to the queue. Pieces pushed after [`WorkQueue::close`] are dropped.
    pub fn push(&self, piece: PieceProgress) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.pieces.push_back(piece);
        }
        self.notify.notify_waiters();
    }

    /// Wakes up every waiting connection and makes [`WorkQueue::next_matching`] return `None`
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.pieces.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Takes the first queued piece accepted by `wanted`, waiting until one shows up.
    /// Returns `None` once the queue is closed.
    pub async fn next_matching<F>(&self, wanted: F) -> Option<PieceProgress>
    where
        F: Fn(&PieceProgress) -> bool,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking, so a push between the check and the await isn't missed
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(position) = state.pieces.iter().position(|piece| wanted(piece)) {
                    return state.pieces.remove(position);
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn piece(index: u32) -> PieceProgress {
        PieceProgress::new(index, 10, [0; 20])
    }

    #[tokio::test]
    async fn takes_the_first_wanted_piece() {
        let queue = WorkQueue::new([piece(0), piece(1), piece(2)]);

        let taken = queue.next_matching(|piece| piece.index != 0).await.expect("a piece");
        assert_eq!(taken.index, 1);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn filter_sees_who_rejected_a_piece() {
        let peer = std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, 6881);
        let mut rejected = piece(0);
        rejected.record_failure(peer);
        let queue = WorkQueue::new([rejected, piece(1)]);

        let taken = queue
            .next_matching(|piece| !piece.was_rejected_from(peer))
            .await
            .expect("a piece");
        assert_eq!(taken.index, 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn waits_for_a_pushed_piece() {
        let queue = Arc::new(WorkQueue::new([piece(0)]));

        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.next_matching(|piece| piece.index == 5).await.map(|piece| piece.index) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.push(piece(5));
        assert_eq!(waiter.await.expect("waiter panicked"), Some(5));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let queue = Arc::new(WorkQueue::new([]));

        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.next_matching(|_| true).await.is_none() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.close();
        assert!(waiter.await.expect("waiter panicked"));

        queue.push(piece(1));
        assert!(queue.is_empty());
        assert!(queue.is_closed());
    }
}
