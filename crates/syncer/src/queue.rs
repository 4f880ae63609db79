//! Deduplicating work queue with per-item exponential backoff.
//!
//! A request is queued at most once. While a worker processes it, further adds
//! only mark it dirty and it is queued again when the worker calls [`WorkQueue::done`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;

use crate::Request;

#[derive(Default)]
struct State {
    order: VecDeque<Request>,
    dirty: FxHashSet<Request>,
    processing: FxHashSet<Request>,
    failures: FxHashMap<Request, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl WorkQueue {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { state: Mutex::new(State::default()), notify: Notify::new(), base_delay, max_delay }
    }

    pub fn add(&self, req: Request) {
        let mut st = self.state.lock();
        if st.shutting_down || st.dirty.contains(&req) {
            return;
        }
        st.dirty.insert(req.clone());
        if st.processing.contains(&req) {
            return;
        }
        st.order.push_back(req);
        drop(st);
        self.notify.notify_one();
    }

    /// Waits for the next request. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<Request> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(req) = st.order.pop_front() {
                    st.dirty.remove(&req);
                    st.processing.insert(req.clone());
                    let more = !st.order.is_empty();
                    drop(st);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(req);
                }
            }
            notified.await;
        }
    }

    /// Ends processing of `req`, queueing it again if it was added meanwhile.
    pub fn done(&self, req: &Request) {
        let mut st = self.state.lock();
        st.processing.remove(req);
        if st.dirty.contains(req) && !st.shutting_down {
            st.order.push_back(req.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    pub fn add_after(self: &Arc<Self>, req: Request, delay: Duration) {
        if delay.is_zero() {
            self.add(req);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(req);
        });
    }

    /// Re-adds `req` after its backoff: `base * 2^(failures - 1)`, capped.
    pub fn add_rate_limited(self: &Arc<Self>, req: Request) {
        let delay = {
            let mut st = self.state.lock();
            let failures = st.failures.entry(req.clone()).or_insert(0);
            *failures += 1;
            self.backoff(*failures)
        };
        self.add_after(req, delay);
    }

    fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    /// Clears the backoff of `req`.
    pub fn forget(&self, req: &Request) {
        self.state.lock().failures.remove(req);
    }

    pub fn num_requeues(&self, req: &Request) -> u32 {
        self.state.lock().failures.get(req).copied().unwrap_or(0)
    }

    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsync_core::NamespacedName;

    fn req(name: &str) -> Request {
        Request::virtual_(&NamespacedName::new("default", name))
    }

    fn queue() -> Arc<WorkQueue> {
        Arc::new(WorkQueue::new(Duration::from_millis(5), Duration::from_secs(1000)))
    }

    #[tokio::test]
    async fn duplicates_collapse() {
        let q = queue();
        q.add(req("a"));
        q.add(req("a"));
        q.add(req("b"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some(req("a")));
        assert_eq!(q.get().await, Some(req("b")));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn adds_during_processing_wait_for_done() {
        let q = queue();
        q.add(req("a"));
        let got = q.get().await.unwrap();
        q.add(req("a"));
        assert!(q.is_empty());
        q.done(&got);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(req("a")));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let q = WorkQueue::new(Duration::from_millis(5), Duration::from_secs(1000));
        assert_eq!(q.backoff(1), Duration::from_millis(5));
        assert_eq!(q.backoff(2), Duration::from_millis(10));
        assert_eq!(q.backoff(4), Duration::from_millis(40));
        assert_eq!(q.backoff(40), Duration::from_secs(1000));
    }

    #[tokio::test]
    async fn rate_limited_adds_count_until_forgotten() {
        let q = queue();
        q.add_rate_limited(req("a"));
        q.add_rate_limited(req("a"));
        assert_eq!(q.num_requeues(&req("a")), 2);
        assert_eq!(q.get().await, Some(req("a")));
        q.forget(&req("a"));
        assert_eq!(q.num_requeues(&req("a")), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        q.add(req("a"));
        assert!(q.is_empty());
    }
}
