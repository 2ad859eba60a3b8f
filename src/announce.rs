//! Bounded buffer between the DHT node and the crawl supervisor.
//!
//! Producers `put` from the UDP read path; the consumer parks on `wait`,
//! then drains with `get` until empty. Announcements are lossy by design:
//! past the soft cap the oldest pending item is dropped, because the
//! network will replay similar traffic within seconds.

use crate::types::Announcement;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

pub struct AnnounceQueue {
    items: Mutex<VecDeque<Announcement>>,
    pending: Notify,
    cap: usize,
}

impl AnnounceQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            pending: Notify::new(),
            cap: cap.max(1),
        }
    }

    pub fn put(&self, a: Announcement) {
        let was_empty;
        {
            let mut items = self.items.lock().unwrap();
            was_empty = items.is_empty();
            items.push_back(a);
            if items.len() > self.cap {
                items.pop_front();
            }
        }
        // notify_one stores a permit when nobody is parked yet, so a put
        // racing ahead of the consumer's wait() is never lost
        if was_empty {
            self.pending.notify_one();
        }
    }

    pub fn get(&self) -> Option<Announcement> {
        self.items.lock().unwrap().pop_front()
    }

    /// Completes once the queue has transitioned from empty to non-empty
    /// since the last drain.
    pub async fn wait(&self) {
        self.pending.notified().await;
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn ann(n: u8) -> Announcement {
        Announcement {
            info_hash: [n; 20],
            peer: format!("10.0.0.{n}:6881").parse().unwrap(),
        }
    }

    #[test]
    fn fifo_order() {
        let q = AnnounceQueue::new(8);
        q.put(ann(1));
        q.put(ann(2));
        assert_eq!(q.get(), Some(ann(1)));
        assert_eq!(q.get(), Some(ann(2)));
        assert_eq!(q.get(), None);
    }

    #[test]
    fn overflow_drops_oldest() {
        let q = AnnounceQueue::new(2);
        q.put(ann(1));
        q.put(ann(2));
        q.put(ann(3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get(), Some(ann(2)));
        assert_eq!(q.get(), Some(ann(3)));
    }

    #[tokio::test]
    async fn wait_wakes_on_put() {
        let q = Arc::new(AnnounceQueue::new(8));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            q2.wait().await;
            q2.get()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.put(ann(7));
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(ann(7)));
    }

    #[tokio::test]
    async fn put_before_wait_is_not_lost() {
        let q = AnnounceQueue::new(8);
        q.put(ann(1));
        tokio::time::timeout(Duration::from_millis(100), q.wait())
            .await
            .expect("stored permit should complete wait immediately");
        assert_eq!(q.get(), Some(ann(1)));
    }
}
