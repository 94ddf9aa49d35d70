//! Thread-safe FIFO of pending updates, double-buffered so draining never
//! holds the lock across update application (spec §4.1).

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use log::warn;

use crate::manager::Manager;
use crate::update::Update;

struct Inner<M: Manager> {
    pending: VecDeque<Box<dyn Update<M>>>,
    /// True once the producer has committed to blocking in the
    /// multiplexer wait. Enqueue only signals a wakeup while this is true,
    /// which collapses concurrent submissions into at most one wakeup
    /// between waits (spec §4.1, invariant 4).
    selecting: bool,
}

pub(crate) struct UpdateQueue<M: Manager> {
    inner: Mutex<Inner<M>>,
    wake: Box<dyn Fn() -> io::Result<()> + Send + Sync>,
}

impl<M: Manager> UpdateQueue<M> {
    pub fn new(wake: impl Fn() -> io::Result<()> + Send + Sync + 'static) -> Self {
        UpdateQueue {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                selecting: false,
            }),
            wake: Box::new(wake),
        }
    }

    pub fn enqueue(&self, update: Box<dyn Update<M>>) {
        self.push(update, false);
    }

    /// Inserts at the head, for `dump`'s "drain it next wake" contract
    /// (spec §4.7).
    pub fn enqueue_front(&self, update: Box<dyn Update<M>>) {
        self.push(update, true);
    }

    fn push(&self, update: Box<dyn Update<M>>, front: bool) {
        let mut inner = self.inner.lock().unwrap();
        if front {
            inner.pending.push_front(update);
        } else {
            inner.pending.push_back(update);
        }
        if inner.selecting {
            inner.selecting = false;
            drop(inner);
            if let Err(err) = (self.wake)() {
                warn!("waking selector failed: {err}");
            }
        }
    }

    /// Swaps the primary queue into `buf` under the lock, then releases it
    /// before the caller applies anything. Returns `false` if there was
    /// nothing to drain, leaving `buf` untouched.
    pub fn drain_into(&self, buf: &mut VecDeque<Box<dyn Update<M>>>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.pending.is_empty() {
            return false;
        }
        std::mem::swap(&mut inner.pending, buf);
        true
    }

    /// Flips the selecting flag. Set to `true` right before the producer
    /// blocks on the multiplexer, and cleared on wake.
    pub fn set_selecting(&self, value: bool) {
        self.inner.lock().unwrap().selecting = value;
    }

    /// Labels of currently pending updates, snapshotted by the dumping
    /// thread before its `DumpKeys` update reaches the head of the queue
    /// (spec §4.7).
    pub fn pending_labels(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|u| u.label())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::update::Apply;

    struct NullManager;
    impl Manager for NullManager {
        fn new_endpoint(
            &self,
            _channel: mio::net::TcpStream,
            _token: mio::Token,
            _selector: crate::selector::SelectorHandle<Self>,
        ) -> io::Result<Arc<dyn crate::endpoint::SelectableEndpoint>>
        where
            Self: Sized,
        {
            unreachable!()
        }
        fn new_connection(&self, _endpoint: &Arc<dyn crate::endpoint::SelectableEndpoint>, _ctx: crate::manager::ConnectContext) {}
        fn do_accept(&self, _server: &mio::net::TcpListener) -> io::Result<Option<mio::net::TcpStream>> {
            unreachable!()
        }
        fn do_finish_connect(&self, _channel: &mio::net::TcpStream) -> io::Result<bool> {
            unreachable!()
        }
        fn connect_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(0)
        }
        fn executor(&self) -> &dyn crate::manager::Executor {
            unreachable!()
        }
        fn scheduler(&self) -> &dyn crate::manager::Scheduler {
            unreachable!()
        }
    }

    struct Labelled(&'static str, Arc<Mutex<Vec<&'static str>>>);
    impl Update<NullManager> for Labelled {
        fn apply(&self, _ctx: &mut Apply<'_, NullManager>) {
            self.1.lock().unwrap().push(self.0);
        }
        fn label(&self) -> String {
            self.0.to_string()
        }
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let queue: UpdateQueue<NullManager> = UpdateQueue::new(|| Ok(()));
        queue.enqueue(Box::new(Labelled("a", applied.clone())));
        queue.enqueue(Box::new(Labelled("b", applied.clone())));
        queue.enqueue(Box::new(Labelled("c", applied.clone())));

        let mut buf = VecDeque::new();
        assert!(queue.drain_into(&mut buf));
        assert_eq!(buf.iter().map(|u| u.label()).collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn drain_returns_false_when_empty() {
        let queue: UpdateQueue<NullManager> = UpdateQueue::new(|| Ok(()));
        let mut buf = VecDeque::new();
        assert!(!queue.drain_into(&mut buf));
    }

    #[test]
    fn wake_collapses_concurrent_enqueues_into_one() {
        let wakes = Arc::new(AtomicUsize::new(0));
        let wakes_for_closure = wakes.clone();
        let queue: UpdateQueue<NullManager> = UpdateQueue::new(move || {
            wakes_for_closure.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let applied = Arc::new(Mutex::new(Vec::new()));

        // Not selecting yet: enqueues should never wake.
        queue.enqueue(Box::new(Labelled("a", applied.clone())));
        assert_eq!(wakes.load(Ordering::SeqCst), 0);

        // Producer commits to blocking...
        queue.set_selecting(true);
        // ...two submissions race in before the wait actually starts; only
        // the first should trigger a wakeup (spec §4.1, invariant 4).
        queue.enqueue(Box::new(Labelled("b", applied.clone())));
        queue.enqueue(Box::new(Labelled("c", applied.clone())));
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pending_labels_reflects_queue_snapshot() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let queue: UpdateQueue<NullManager> = UpdateQueue::new(|| Ok(()));
        queue.enqueue(Box::new(Labelled("a", applied.clone())));
        queue.enqueue_front(Box::new(Labelled("z", applied)));
        assert_eq!(queue.pending_labels(), vec!["z", "a"]);
    }
}
