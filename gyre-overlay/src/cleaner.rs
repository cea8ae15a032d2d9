//! Scoped teardown of timers, callbacks, and sub-resources.
//!
//! Every long-lived object (node, peer connection, raw connection, ring
//! node) owns a [`Cleaner`]. Timers are named tokio tasks the cleaner can
//! cancel idempotently; release actions run LIFO on [`Cleaner::clean`].
//! Cleaners form a tree: cleaning a parent cleans its children first. Once
//! cleaned, a cleaner is dead and new timers become no-ops.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

pub struct Cleaner {
    name: String,
    inner: Mutex<Inner>,
}

struct Inner {
    dead: bool,
    releases: Vec<Box<dyn FnOnce() + Send>>,
    timers: HashMap<String, JoinHandle<()>>,
    children: Vec<Arc<Cleaner>>,
}

impl Cleaner {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Cleaner {
            name: name.into(),
            inner: Mutex::new(Inner {
                dead: false,
                releases: Vec::new(),
                timers: HashMap::new(),
                children: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dead(&self) -> bool {
        self.inner.lock().dead
    }

    /// Create a child cleaner whose lifetime is bounded by this one.
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<Cleaner> {
        let child = Cleaner::new(format!("{}/{}", self.name, name.into()));
        let mut inner = self.inner.lock();
        if inner.dead {
            // Parent already cleaned: the child is born dead.
            child.inner.lock().dead = true;
        } else {
            inner.children.push(Arc::clone(&child));
        }
        child
    }

    /// Register a release action, run LIFO on clean.
    pub fn push(&self, release: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        if inner.dead {
            drop(inner);
            release();
            return;
        }
        inner.releases.push(Box::new(release));
    }

    /// Arm a named one-shot timer. Replaces any timer with the same name.
    /// No-op if the cleaner is dead.
    pub fn set_timer<F>(&self, name: &str, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.dead {
            return;
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        if let Some(old) = inner.timers.insert(name.to_string(), handle) {
            old.abort();
        }
    }

    /// Arm a named periodic timer. The closure is invoked every `period`
    /// until cancelled.
    pub fn set_interval<F, Fut>(&self, name: &str, period: Duration, f: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.dead {
            return;
        }
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // first tick completes immediately
            loop {
                tick.tick().await;
                f().await;
            }
        });
        if let Some(old) = inner.timers.insert(name.to_string(), handle) {
            old.abort();
        }
    }

    /// Cancel a named timer. Idempotent; unknown names are ignored.
    pub fn cancel_timer(&self, name: &str) {
        if let Some(handle) = self.inner.lock().timers.remove(name) {
            handle.abort();
        }
    }

    /// Cancel all timers, clean children, run release actions LIFO, and
    /// mark this cleaner dead.
    pub fn clean(&self) {
        let (timers, releases, children) = {
            let mut inner = self.inner.lock();
            if inner.dead {
                return;
            }
            inner.dead = true;
            (
                std::mem::take(&mut inner.timers),
                std::mem::take(&mut inner.releases),
                std::mem::take(&mut inner.children),
            )
        };
        for (_, handle) in timers {
            handle.abort();
        }
        for child in children {
            child.clean();
        }
        for release in releases.into_iter().rev() {
            release();
        }
    }
}

impl std::fmt::Debug for Cleaner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cleaner")
            .field("name", &self.name)
            .field("dead", &self.is_dead())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn releases_run_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let cleaner = Cleaner::new("t");
        for i in 0..3 {
            let order = Arc::clone(&order);
            cleaner.push(move || order.lock().push(i));
        }
        cleaner.clean();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let cleaner = Cleaner::new("t");
        let f = Arc::clone(&fired);
        cleaner.set_timer("ping", Duration::from_millis(20), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        cleaner.cancel_timer("ping");
        cleaner.cancel_timer("ping"); // idempotent
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dead_cleaner_ignores_new_timers() {
        let fired = Arc::new(AtomicUsize::new(0));
        let cleaner = Cleaner::new("t");
        cleaner.clean();
        let f = Arc::clone(&fired);
        cleaner.set_timer("late", Duration::from_millis(10), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cleaning_parent_cleans_children() {
        let parent = Cleaner::new("p");
        let child = parent.child("c");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        child.set_timer("x", Duration::from_millis(20), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        parent.clean();
        assert!(child.is_dead());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
