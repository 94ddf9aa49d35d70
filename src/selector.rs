//! The public `ManagedSelector` API: construction, start/stop lifecycle,
//! and the `SelectorHandle` surface endpoints and managers use to submit
//! updates (spec §4.6, §6).

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token, Waker};

use crate::acceptor::Accept;
use crate::connect::Connect;
use crate::endpoint::SelectableEndpoint;
use crate::error::SelectorError;
use crate::latch::latch;
use crate::manager::Manager;
use crate::producer::Producer;
use crate::queue::UpdateQueue;
use crate::strategy::EatWhatYouKill;
use crate::update::{
    CloseConnections, DestroyEndpoint, FillEndpointKey, ForgetConnect, ModifyInterest, Start, StopSelector,
};
use crate::SelectorConfig;

/// Reserved token for the wakeup registration, outside the range
/// `KeyTable` ever hands out (its tokens start at 0 and grow by one).
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

struct Shared<M: Manager> {
    config: SelectorConfig,
    queue: Arc<UpdateQueue<M>>,
    size: Arc<AtomicUsize>,
    starting: AtomicBool,
    started: Arc<AtomicBool>,
    stopping: AtomicBool,
    stopped: AtomicBool,
    strategy: Mutex<Option<Arc<EatWhatYouKill<M>>>>,
}

/// A reference to a running (or not-yet-started) selector, cheap to clone
/// and handed to endpoints so they can submit their own updates (spec
/// §4.5: "the endpoint may enqueue an update to change its interest
/// mask").
pub struct SelectorHandle<M: Manager> {
    shared: Arc<Shared<M>>,
}

impl<M: Manager> Clone for SelectorHandle<M> {
    fn clone(&self) -> Self {
        SelectorHandle {
            shared: self.shared.clone(),
        }
    }
}

/// One managed, non-blocking I/O event dispatch core wrapping a single OS
/// readiness multiplexer (spec §1, §3).
pub struct ManagedSelector<M: Manager + 'static> {
    handle: SelectorHandle<M>,
}

impl<M: Manager + 'static> std::ops::Deref for ManagedSelector<M> {
    type Target = SelectorHandle<M>;
    fn deref(&self) -> &SelectorHandle<M> {
        &self.handle
    }
}

impl<M: Manager + 'static> ManagedSelector<M> {
    /// Creates the multiplexer via `manager.new_multiplexer()` and wires
    /// up the wakeup registration, the update queue, and the producer.
    /// Does not start the loop; call [`start`](Self::start) for that.
    pub fn new(manager: Arc<M>, config: SelectorConfig) -> io::Result<Self> {
        let poll = manager.new_multiplexer()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(&registry, WAKE_TOKEN)?);

        let queue = Arc::new(UpdateQueue::new(move || waker.wake()));
        let size = Arc::new(AtomicUsize::new(0));
        let shared = Arc::new(Shared {
            config: config.clone(),
            queue: queue.clone(),
            size: size.clone(),
            starting: AtomicBool::new(false),
            started: Arc::new(AtomicBool::new(false)),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            strategy: Mutex::new(None),
        });
        let handle = SelectorHandle {
            shared: shared.clone(),
        };

        let producer = Producer::new(poll, manager.clone(), queue, config, handle.clone(), size);
        let strategy = EatWhatYouKill::new(manager, producer);
        *shared.strategy.lock().unwrap() = Some(strategy);

        Ok(ManagedSelector { handle })
    }

    /// Returns a cheaply-cloneable handle to this selector.
    pub fn handle(&self) -> SelectorHandle<M> {
        self.handle.clone()
    }

    /// Hands the producer to the executor, enqueues `Start`, and waits for
    /// the loop to mark itself running before returning (spec §4.6).
    pub fn start(&self) -> Result<(), SelectorError> {
        let shared = &self.handle.shared;
        if shared.starting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (signal, waiter) = latch();
        shared.queue.enqueue(Box::new(Start {
            started: shared.started.clone(),
            signal: Mutex::new(Some(signal)),
        }));

        let strategy = shared
            .strategy
            .lock()
            .unwrap()
            .clone()
            .expect("strategy is set in ManagedSelector::new");
        strategy.dispatch();

        waiter.wait();
        Ok(())
    }

    /// Idempotent two-phase shutdown: `CloseConnections` then
    /// `StopSelector`, each awaited before the next is enqueued, so any
    /// keys closing produces are observed by the loop before the
    /// multiplexer is released (spec §4.6).
    pub fn stop(&self) -> Result<(), SelectorError> {
        let shared = &self.handle.shared;
        if shared.stopping.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (zero_signal, _zero_waiter) = latch();
        let (complete_signal, complete_waiter) = latch();
        shared.queue.enqueue(Box::new(CloseConnections {
            zero_remaining: Mutex::new(Some(zero_signal)),
            complete: Mutex::new(Some(complete_signal)),
            already_closed: Arc::new(Mutex::new(HashSet::new())),
        }));
        complete_waiter.wait();

        let (stop_signal, stop_waiter) = latch();
        shared.queue.enqueue(Box::new(StopSelector {
            signal: Mutex::new(Some(stop_signal)),
        }));
        stop_waiter.wait();

        shared.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl<M: Manager + 'static> SelectorHandle<M> {
    fn rejected_after_stop(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Registers a server channel for passive accept (spec §4.4,
    /// "Acceptor"). For use by the manager when binding server sockets.
    pub fn accept(&self, listener: TcpListener) {
        if self.rejected_after_stop() {
            return;
        }
        self.shared.queue.enqueue(Box::new(Accept {
            server: Mutex::new(Some(listener)),
        }));
    }

    /// Registers a connecting channel and installs its timeout (spec
    /// §4.4, "Connect"). For use by the manager when initiating client
    /// connects.
    pub fn connect(&self, channel: TcpStream) {
        if self.rejected_after_stop() {
            return;
        }
        self.shared.queue.enqueue(Box::new(Connect {
            channel: Mutex::new(Some(channel)),
        }));
    }

    /// Submits an interest-mask change for one of this selector's own
    /// keys (spec §4.5, "Update key"). Called by endpoint implementations
    /// from inside their own `update_key`.
    pub fn modify_interest(&self, token: Token, interest: Interest) {
        if self.rejected_after_stop() {
            return;
        }
        self.shared
            .queue
            .enqueue(Box::new(ModifyInterest { token, interest }));
    }

    /// Wakes the loop to flush cancelled-key cleanup and dispatches
    /// endpoint destruction, rather than closing the endpoint directly
    /// from the calling thread (spec §6, `destroyEndPoint`).
    pub fn destroy_endpoint(&self, endpoint: Arc<dyn SelectableEndpoint>, cause: Option<SelectorError>) {
        if self.rejected_after_stop() {
            return;
        }
        self.shared.queue.enqueue(Box::new(DestroyEndpoint {
            endpoint,
            cause: Mutex::new(cause),
        }));
    }

    /// Best-effort count of live keys, maintained by the producer thread
    /// (spec §6, Open Question (c)).
    pub fn size(&self) -> usize {
        self.shared.size.load(Ordering::SeqCst)
    }

    /// Synthesises a `DumpKeys` update at the head of the queue and waits
    /// up to the configured timeout for a coherent snapshot (spec §4.7).
    pub fn dump(&self) -> Result<String, SelectorError> {
        if self.rejected_after_stop() {
            return Err(SelectorError::AlreadyStopped);
        }
        let pending = self.shared.queue.pending_labels();
        let out = Arc::new(Mutex::new(None));
        let (signal, waiter) = latch();
        self.shared.queue.enqueue_front(Box::new(crate::update::DumpKeys {
            signal: Mutex::new(Some(signal)),
            out: out.clone(),
            pending_snapshot: pending,
        }));
        if !waiter.wait_timeout(self.shared.config.dump_timeout) {
            return Err(SelectorError::DumpTimedOut);
        }
        Ok(out.lock().unwrap().take().unwrap_or_default())
    }

    /// Evicts a connect key whose timeout already won the race, or a
    /// reserved active-accept key whose endpoint never finished
    /// constructing, dropping the stale registration (spec §4.4).
    pub(crate) fn forget_connect(&self, token: Token) {
        self.shared.queue.enqueue(Box::new(ForgetConnect { token }));
    }

    /// Fills a key reserved by `ActiveAccept` once the worker thread has
    /// built the endpoint for it (spec §4.4, "Active Accept").
    pub(crate) fn fill_endpoint_key(&self, token: Token, endpoint: Arc<dyn SelectableEndpoint>) {
        self.shared
            .queue
            .enqueue(Box::new(FillEndpointKey { token, endpoint }));
    }

    /// Called by the producer once `StopSelector` has been applied, so
    /// later calls on this handle start rejecting or no-op-ing (spec §8,
    /// invariant 5).
    pub(crate) fn mark_stopped(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }
}
