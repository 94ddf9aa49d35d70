use std::io;
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Poll, Token};

use crate::endpoint::{SelectableEndpoint, Task};
use crate::error::SelectorError;
use crate::selector::SelectorHandle;

/// An executor that runs produced tasks, shared across all selectors
/// (spec §5, §6). Rejection must be non-blocking; the selector closes
/// rejected work where that is meaningful.
pub trait Executor: Send + Sync {
    fn submit(&self, task: Task) -> Result<(), Task>;
}

/// A cancellable scheduled task, used to drive connect timeouts.
pub trait TimeoutHandle: Send {
    /// Returns `true` if the timeout was cancelled before it fired.
    fn cancel(&self) -> bool;
}

/// Schedules a task to run after a delay, returning a handle that can
/// cancel it (spec §6).
pub trait Scheduler: Send + Sync {
    fn schedule(&self, task: Task, delay: Duration) -> Box<dyn TimeoutHandle>;
}

/// The host manager: supplies the executor, scheduler, and endpoint/
/// connection factories, and receives the lifecycle callbacks the
/// original design expressed as overridable methods (spec §6, §9 — those
/// subclass hooks become these trait methods instead).
///
/// The selector never constructs sockets itself; every socket it touches
/// (server listeners for passive accept, client streams for connect and
/// accept) is supplied or produced by the manager.
pub trait Manager: Send + Sync {
    /// Creates the OS multiplexer this selector will wrap. Defaults to a
    /// fresh `mio::Poll`; a manager may override this to share
    /// instrumentation across selectors.
    fn new_multiplexer(&self) -> io::Result<Poll> {
        Poll::new()
    }

    /// Wraps a channel (freshly connected or accepted) in an endpoint.
    /// `token` is the key already reserved for this channel in the
    /// producer's table; `selector` lets the endpoint submit updates and
    /// destroy itself.
    fn new_endpoint(
        &self,
        channel: TcpStream,
        token: Token,
        selector: SelectorHandle<Self>,
    ) -> io::Result<Arc<dyn SelectableEndpoint>>
    where
        Self: Sized;

    /// Notifies the manager that a connection has been established over
    /// `endpoint`, so it can build whatever connection-level object sits
    /// above the endpoint.
    fn new_connection(&self, endpoint: &Arc<dyn SelectableEndpoint>, context: ConnectContext);

    /// Accepts as many channels as are immediately available on
    /// `server`, returning `None` once accepting would block.
    fn do_accept(&self, server: &TcpListener) -> io::Result<Option<TcpStream>>;

    /// Attempts to complete a non-blocking connect. Returns `true` once
    /// the channel is connected.
    fn do_finish_connect(&self, channel: &TcpStream) -> io::Result<bool>;

    fn on_accepting(&self, _channel: &TcpStream) {}
    fn on_accepted(&self, _channel: &TcpStream) {}
    fn on_accept_failed(&self, _cause: &SelectorError) {}

    fn end_point_opened(&self, _endpoint: &Arc<dyn SelectableEndpoint>) {}
    fn end_point_closed(&self, _endpoint: &Arc<dyn SelectableEndpoint>) {}

    fn connection_opened(&self, _endpoint: &Arc<dyn SelectableEndpoint>) {}
    fn connection_closed(&self, _endpoint: &Arc<dyn SelectableEndpoint>) {}
    fn connection_failed(&self, _channel: &TcpStream, _cause: &SelectorError) {}

    /// Invoked when the multiplexer wait itself fails fatally (spec §4.2,
    /// §7). The original design's `onSelectFailed` override.
    fn on_select_failed(&self, _cause: &SelectorError) {}

    fn connect_timeout(&self) -> Duration;

    fn executor(&self) -> &dyn Executor;
    fn scheduler(&self) -> &dyn Scheduler;
}

/// Context passed to `Manager::new_connection` describing which connect
/// path completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectContext {
    /// The connection was actively opened by this process via `Connect`.
    Active,
    /// The connection arrived via a passive `Acceptor`.
    Accepted,
}
