use std::io;

use crate::error::SelectorError;
use mio::event::Event;
use mio::{Interest, Registry, Token};

/// A unit of work produced in response to readiness, handed to the
/// execution strategy (spec §4.3, §4.5).
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The four readiness bits the core cares about, extracted from a
/// `mio::event::Event` so callbacks don't need to borrow the `Events`
/// buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub read_closed: bool,
    pub write_closed: bool,
}

impl From<&Event> for Readiness {
    fn from(ev: &Event) -> Self {
        Readiness {
            readable: ev.is_readable(),
            writable: ev.is_writable(),
            error: ev.is_error(),
            read_closed: ev.is_read_closed(),
            write_closed: ev.is_write_closed(),
        }
    }
}

/// The minimal interface by which a registered channel's attachment
/// reacts to readiness and to post-processing of its key (spec §4.5).
///
/// Both methods are invoked only from the producer thread. Implementations
/// must not re-enter the selector synchronously from `on_selected`.
pub trait SelectableEndpoint: Send + Sync {
    /// Given current readiness, return a task to execute (possibly
    /// blocking), or `None` if nothing needs to run right now.
    fn on_selected(&self, readiness: Readiness) -> Option<Task>;

    /// Called after the current readiness batch, at most once per wait
    /// cycle, only for keys that appeared ready in that cycle. The
    /// endpoint may enqueue an update here to change its interest mask.
    fn update_key(&self);

    /// Called when the core is closing this endpoint's key, either
    /// because the key was cancelled, readiness processing failed, or the
    /// selector is shutting down.
    fn close(&self, cause: Option<&SelectorError>);

    /// Registers this endpoint's own channel with `registry` for the
    /// first time, at the given token and interest. Called exactly once
    /// per key, the first time anything asks this endpoint's key for an
    /// interest mask (it starts unregistered: §4.4 "Active Accept"
    /// registers the channel's key with interest 0, meaning no interest
    /// at all, which `mio` cannot express as an actual registration).
    fn register(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()>;

    /// Re-registers this endpoint's own channel with `registry` at a new
    /// interest set, once it is already registered. The core holds no
    /// reference to the raw channel once an endpoint is created (it never
    /// mutates endpoint internals, spec §3); it is the endpoint's job to
    /// apply the change to whatever socket it owns. Called only from the
    /// producer thread, while applying an update the endpoint itself
    /// enqueued from `update_key`.
    fn reregister(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()>;
}
