use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Depth-bounded datagram queue with async wakeup.
///
/// Pushing never blocks; when the queue is at depth the item is refused
/// and the caller decides whether that loss is reportable. Waiters park
/// on the notify handle and re-check, so a wakeup without an item is
/// harmless.
pub(crate) struct RecvQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    depth: usize,
}

impl<T> RecvQueue<T> {
    pub fn new(depth: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            depth,
        }
    }

    /// Append an item, refusing it when the queue is full.
    pub fn push(&self, item: T) -> bool {
        {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.depth {
                return false;
            }
            items.push_back(item);
        }

        self.notify.notify_one();
        true
    }

    /// Take the oldest item, if any.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    /// Future completing on the next wakeup.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wake every parked waiter, item or not.
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Drop all queued items.
    pub fn purge(&self) {
        self.items.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_fifo_order() {
        let queue = RecvQueue::new(4);

        assert!(queue.push(1));
        assert!(queue.push(2));
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn queue_refuses_beyond_depth() {
        let queue = RecvQueue::new(2);

        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn queue_purge() {
        let queue = RecvQueue::new(4);

        queue.push(1);
        queue.push(2);
        queue.purge();
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn queue_wakes_parked_reader() {
        use std::sync::Arc;

        let queue = Arc::new(RecvQueue::new(4));

        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move {
                loop {
                    let parked = queue.notified();
                    if let Some(v) = queue.try_pop() {
                        return v;
                    }
                    parked.await;
                }
            })
        };

        tokio::task::yield_now().await;
        queue.push(7);

        assert_eq!(reader.await.unwrap(), 7);
    }
}
