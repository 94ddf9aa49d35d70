//! The single-consumer state machine that alternates between processing
//! selected keys, applying updates, and blocking on the multiplexer (spec
//! §4.2). Its entire state lives in its fields so it is cheap to suspend
//! and resume between calls to `produce` (spec §4.3).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace, warn};
use mio::event::Events;
use mio::{Poll, Token};

use crate::acceptor::ActiveAccept;
use crate::connect::{complete_connect, ConnectOutcome, ConnectRequest};
use crate::endpoint::{Readiness, SelectableEndpoint, Task};
use crate::error::SelectorError;
use crate::keys::{Attachment, KeyTable};
use crate::manager::Manager;
use crate::queue::UpdateQueue;
use crate::selector::{SelectorHandle, WAKE_TOKEN};
use crate::update::{Apply, Update};
use crate::SelectorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ProcessingKeys,
    AfterProcessing,
    ApplyingUpdates,
    Waiting,
    Stopped,
}

/// An owned snapshot of one key's attachment kind, taken before any
/// further mutation of `self.keys` so the match that follows never holds
/// a live borrow into the key table.
enum KeyKind {
    Endpoint(Arc<dyn SelectableEndpoint>),
    Connect(Arc<ConnectRequest>),
    Acceptor,
    Other,
}

impl From<&Attachment> for KeyKind {
    fn from(attachment: &Attachment) -> Self {
        match attachment {
            Attachment::Endpoint(ep) => KeyKind::Endpoint(ep.clone()),
            Attachment::Connect(req) => KeyKind::Connect(req.clone()),
            Attachment::Acceptor(_) => KeyKind::Acceptor,
            Attachment::Reserved => KeyKind::Other,
        }
    }
}

pub(crate) struct Producer<M: Manager> {
    poll: Poll,
    events: Events,
    ready: Vec<(Token, Readiness)>,
    cursor: usize,
    aux: VecDeque<Box<dyn Update<M>>>,
    phase: Phase,
    keys: KeyTable,
    manager: Arc<M>,
    queue: Arc<UpdateQueue<M>>,
    config: SelectorConfig,
    handle: SelectorHandle<M>,
    size: Arc<AtomicUsize>,
    poll_on_zero_select: bool,
    stop_requested: bool,
}

impl<M: Manager + 'static> Producer<M> {
    pub fn new(
        poll: Poll,
        manager: Arc<M>,
        queue: Arc<UpdateQueue<M>>,
        config: SelectorConfig,
        handle: SelectorHandle<M>,
        size: Arc<AtomicUsize>,
    ) -> Self {
        let poll_on_zero_select = config.poll_on_zero_select.resolve();
        Producer {
            poll,
            events: Events::with_capacity(1024),
            ready: Vec::new(),
            cursor: 0,
            aux: VecDeque::new(),
            phase: Phase::ApplyingUpdates,
            keys: KeyTable::new(),
            manager,
            queue,
            config,
            handle,
            size,
            poll_on_zero_select,
            stop_requested: false,
        }
    }

    /// Runs the state machine until it has a task to emit or the selector
    /// has stopped (spec §4.2, §4.3). Returns `None` only once the
    /// selector has stopped for good; every other "nothing to do right
    /// now" outcome is absorbed internally by looping to the next phase.
    pub fn produce(&mut self) -> Option<Task> {
        loop {
            match self.phase {
                Phase::Stopped => return None,
                Phase::ProcessingKeys => {
                    if let Some(task) = self.process_keys() {
                        return Some(task);
                    }
                    self.phase = Phase::AfterProcessing;
                }
                Phase::AfterProcessing => {
                    self.after_processing();
                    self.phase = Phase::ApplyingUpdates;
                }
                Phase::ApplyingUpdates => {
                    let more = self.apply_updates();
                    self.size.store(self.keys.len(), Ordering::SeqCst);
                    if self.stop_requested {
                        debug!("selector {}: stopped", self.config.id);
                        self.handle.mark_stopped();
                        self.phase = Phase::Stopped;
                        return None;
                    }
                    if !more {
                        self.queue.set_selecting(true);
                        self.phase = Phase::Waiting;
                    }
                }
                Phase::Waiting => match self.wait() {
                    Ok(()) => self.phase = Phase::ProcessingKeys,
                    Err(err) => {
                        error!("selector {}: multiplexer wait failed: {err}", self.config.id);
                        self.manager.on_select_failed(&err);
                        self.handle.mark_stopped();
                        self.phase = Phase::Stopped;
                        return None;
                    }
                },
            }
        }
    }

    /// Phase 1: advance the cursor over the last wait's ready set,
    /// returning the first produced task. Invalid (already-removed) keys
    /// are skipped; their attachment, if any, was already closed by
    /// whatever update removed them.
    fn process_keys(&mut self) -> Option<Task> {
        while self.cursor < self.ready.len() {
            let (token, readiness) = self.ready[self.cursor];
            self.cursor += 1;
            trace!("selector {}: processing key {:?} {:?}", self.config.id, token, readiness);

            // Clone out what we need up front so the match below never
            // holds a borrow of `self.keys` across a later `&mut self`
            // call (e.g. `drain_acceptor`, `keys.get_mut`).
            let kind = match self.keys.get(token) {
                Some(entry) => KeyKind::from(&entry.attachment),
                None => continue,
            };
            match kind {
                KeyKind::Endpoint(ep) => {
                    if let Some(task) = ep.on_selected(readiness) {
                        return Some(task);
                    }
                }
                KeyKind::Connect(req) => {
                    match complete_connect(&self.manager, &req, token, self.handle.clone()) {
                        ConnectOutcome::Endpoint(endpoint) => {
                            if let Some(entry) = self.keys.get_mut(token) {
                                entry.attachment = Attachment::Endpoint(endpoint);
                            }
                        }
                        ConnectOutcome::Pending => {}
                        ConnectOutcome::Closed => {
                            self.keys.remove(token);
                        }
                    }
                }
                KeyKind::Acceptor => self.drain_acceptor(token),
                KeyKind::Other => {}
            }
        }
        None
    }

    /// Repeatedly accepts from one acceptor until it would block (spec
    /// §4.4: "loop calling the manager's accept until it returns nothing,
    /// then return no task").
    fn drain_acceptor(&mut self, token: Token) {
        loop {
            let accepted = {
                let Some(entry) = self.keys.get(token) else { return };
                let Attachment::Acceptor(listener) = &entry.attachment else {
                    return;
                };
                self.manager.do_accept(listener)
            };
            match accepted {
                Ok(Some(channel)) => {
                    self.manager.on_accepting(&channel);
                    self.manager.on_accepted(&channel);
                    self.queue.enqueue(Box::new(ActiveAccept {
                        channel: std::sync::Mutex::new(Some(channel)),
                    }));
                }
                Ok(None) => return,
                Err(err) => {
                    warn!("selector {}: accept failed: {err}", self.config.id);
                    self.manager.on_accept_failed(&SelectorError::AcceptFailed(err));
                    return;
                }
            }
        }
    }

    /// Phase 4: post-process every key that appeared ready this cycle,
    /// exactly once each, then clear the batch (spec §4.2, §4.5).
    fn after_processing(&mut self) {
        for (token, _) in &self.ready {
            if let Some(entry) = self.keys.get(*token) {
                if let Attachment::Endpoint(ep) = &entry.attachment {
                    ep.update_key();
                }
            }
        }
        self.ready.clear();
        self.cursor = 0;
    }

    /// Phase 2: swap the queue, apply every update in FIFO order, and
    /// loop again if more arrived meanwhile. Returns `false` once the
    /// queue is observed empty (spec §4.2, §4.1).
    fn apply_updates(&mut self) -> bool {
        if !self.queue.drain_into(&mut self.aux) {
            return false;
        }
        while let Some(update) = self.aux.pop_front() {
            let mut stop_requested = false;
            {
                let mut ctx = Apply {
                    registry: self.poll.registry(),
                    keys: &mut self.keys,
                    manager: &self.manager,
                    handle: &self.handle,
                    config: &self.config,
                    stop_requested: &mut stop_requested,
                };
                update.apply(&mut ctx);
            }
            if stop_requested {
                self.stop_requested = true;
            }
        }
        true
    }

    /// Phase 3: block on the multiplexer, snapshotting the ready set on
    /// wake (spec §4.2).
    fn wait(&mut self) -> Result<(), SelectorError> {
        self.poll
            .poll(&mut self.events, None)
            .map_err(|err| SelectorError::MultiplexerFailed(self.config.id, err))?;

        let mut ready: Vec<(Token, Readiness)> = self
            .events
            .iter()
            .filter(|ev| ev.token() != WAKE_TOKEN)
            .map(|ev| (ev.token(), Readiness::from(ev)))
            .collect();

        self.queue.set_selecting(false);

        if ready.is_empty() && self.poll_on_zero_select {
            // Some multiplexers can lose an edge between a blocking wait
            // returning zero and the next wait being armed; a follow-up
            // non-blocking poll recovers it (spec §4.2 edge case, §6).
            self.poll
                .poll(&mut self.events, Some(Duration::from_millis(0)))
                .map_err(|err| SelectorError::MultiplexerFailed(self.config.id, err))?;
            ready.extend(
                self.events
                    .iter()
                    .filter(|ev| ev.token() != WAKE_TOKEN)
                    .map(|ev| (ev.token(), Readiness::from(ev))),
            );
        }

        self.ready = ready;
        Ok(())
    }
}
