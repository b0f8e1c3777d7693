//! Single-slot buffer between acquisition and detection
//!
//! `LatestSlot` holds at most one pending frame. A newer frame replaces the
//! queued one and the replaced frame is counted as dropped.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

struct SlotInner<T> {
    value: Option<T>,
    closed: bool,
}

/// Drop-oldest single-value buffer (one producer, one consumer)
pub struct LatestSlot<T> {
    inner: Mutex<SlotInner<T>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                value: None,
                closed: false,
            }),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a value, returning the one it replaced. Ignored after close.
    pub fn put(&self, value: T) -> Option<T> {
        let replaced = {
            let mut inner = self.lock();
            if inner.closed {
                return None;
            }
            inner.value.replace(value)
        };
        if replaced.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        replaced
    }

    /// Wait for a value. Returns None once closed and drained.
    pub async fn take(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(value) = inner.value.take() {
                    return Some(value);
                }
                if inner.closed {
                    return None;
                }
            }
            // notify_one stores a permit, so a put between unlock and here is not lost
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts detections in flight and remembers the peak
#[derive(Default)]
pub struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    pub fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { gauge: self }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct InFlightGuard<'a> {
    gauge: &'a InFlightGauge,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_newer_value_replaces_queued() {
        let slot = LatestSlot::new();
        assert_eq!(slot.put(1), None);
        assert_eq!(slot.put(2), Some(1));
        assert_eq!(slot.put(3), Some(2));
        assert_eq!(slot.dropped(), 2);
        assert_eq!(slot.take().await, Some(3));
    }

    #[tokio::test]
    async fn test_take_waits_for_put() {
        let slot = Arc::new(LatestSlot::new());
        let consumer = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.take().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        slot.put("frame");
        assert_eq!(consumer.await.unwrap(), Some("frame"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let slot = LatestSlot::new();
        slot.put(7);
        slot.close();
        assert!(slot.is_closed());
        assert_eq!(slot.put(8), None);
        assert_eq!(slot.take().await, Some(7));
        assert_eq!(slot.take().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_consumer() {
        let slot = Arc::new(LatestSlot::<u32>::new());
        let consumer = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.take().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        slot.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[test]
    fn test_gauge_tracks_peak() {
        let gauge = InFlightGauge::default();
        {
            let _a = gauge.enter();
            let _b = gauge.enter();
            assert_eq!(gauge.current(), 2);
        }
        let _c = gauge.enter();
        assert_eq!(gauge.current(), 1);
        assert_eq!(gauge.peak(), 2);
    }
}
