//! Integration tests for the scenarios in spec §8: a selector driven end
//! to end against real loopback sockets and a hand-written `TestManager`,
//! in the style of `tokio-rs/mio`'s own `tests/test_*.rs` files rather
//! than a mocking framework.

use std::io;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use managed_selector::{
    ConnectContext, Executor, Manager, ManagedSelector, Readiness, Scheduler, SelectableEndpoint,
    SelectorConfig, SelectorError, SelectorHandle, TcpListener, TcpStream, Task, Token, TimeoutHandle,
};
use mio::{Interest, Registry};

/// Spawns each submitted task on its own thread, counting submissions so
/// S1 can assert the producer was handed to the executor exactly once.
struct TestExecutor {
    submit_count: AtomicUsize,
}

impl TestExecutor {
    fn new() -> Self {
        TestExecutor {
            submit_count: AtomicUsize::new(0),
        }
    }
}

impl Executor for TestExecutor {
    fn submit(&self, task: Task) -> Result<(), Task> {
        self.submit_count.fetch_add(1, Ordering::SeqCst);
        thread::spawn(task);
        Ok(())
    }
}

struct TestTimeoutHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimeoutHandle for TestTimeoutHandle {
    fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }
}

/// Runs scheduled tasks on their own delayed thread, honoring cancellation.
struct TestScheduler;

impl Scheduler for TestScheduler {
    fn schedule(&self, task: Task, delay: Duration) -> Box<dyn TimeoutHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_for_thread = cancelled.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if !cancelled_for_thread.load(Ordering::SeqCst) {
                task();
            }
        });
        Box::new(TestTimeoutHandle { cancelled })
    }
}

/// A `SelectableEndpoint` that does nothing on its own; tests observe
/// behaviour through `TestManager`'s counters instead.
struct TestEndpoint {
    channel: Mutex<TcpStream>,
    closed: AtomicBool,
}

impl SelectableEndpoint for TestEndpoint {
    fn on_selected(&self, _readiness: Readiness) -> Option<Task> {
        None
    }

    fn update_key(&self) {}

    fn close(&self, _cause: Option<&SelectorError>) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn register(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.register(&mut *self.channel.lock().unwrap(), token, interest)
    }

    fn reregister(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.reregister(&mut *self.channel.lock().unwrap(), token, interest)
    }
}

/// A one-shot open/wait gate, used to pin the producer thread inside
/// `do_accept` so a test can enqueue updates it knows the producer cannot
/// possibly have drained yet.
struct Gate {
    opened: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Self {
        Gate {
            opened: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.opened.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut guard = self.opened.lock().unwrap();
        while !*guard {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    fn is_open(&self) -> bool {
        *self.opened.lock().unwrap()
    }
}

/// How a test wants `do_finish_connect` answered, since the point of
/// these scenarios is to control the connect race, not depend on real
/// network timing.
enum FinishConnect {
    AlwaysPending,
    SucceedOnFirstCall,
}

struct TestManager {
    executor: TestExecutor,
    scheduler: TestScheduler,
    connect_timeout: Duration,
    finish_connect: FinishConnect,
    finish_connect_calls: AtomicUsize,

    accept_count: AtomicUsize,
    on_accepting_count: AtomicUsize,
    on_accepted_count: AtomicUsize,
    endpoints_opened: AtomicUsize,
    connections_opened: AtomicUsize,
    connections_failed: AtomicUsize,
    last_failure: Mutex<Option<String>>,

    /// When armed, the next `do_accept` call blocks on `release_stall`
    /// after signalling `entered_stall`, instead of touching the listener.
    /// Lets a test pin the producer thread somewhere before it can reach
    /// `ApplyingUpdates`, so updates enqueued meanwhile are guaranteed
    /// still pending when observed.
    stall_next_accept: AtomicBool,
    entered_stall: Gate,
    release_stall: Gate,
}

impl TestManager {
    fn new(connect_timeout: Duration, finish_connect: FinishConnect) -> Self {
        TestManager {
            executor: TestExecutor::new(),
            scheduler: TestScheduler,
            connect_timeout,
            finish_connect,
            finish_connect_calls: AtomicUsize::new(0),
            accept_count: AtomicUsize::new(0),
            on_accepting_count: AtomicUsize::new(0),
            on_accepted_count: AtomicUsize::new(0),
            endpoints_opened: AtomicUsize::new(0),
            connections_opened: AtomicUsize::new(0),
            connections_failed: AtomicUsize::new(0),
            last_failure: Mutex::new(None),
            stall_next_accept: AtomicBool::new(false),
            entered_stall: Gate::new(),
            release_stall: Gate::new(),
        }
    }
}

impl Manager for TestManager {
    fn new_endpoint(
        &self,
        channel: TcpStream,
        _token: Token,
        _selector: SelectorHandle<Self>,
    ) -> io::Result<Arc<dyn SelectableEndpoint>>
    where
        Self: Sized,
    {
        Ok(Arc::new(TestEndpoint {
            channel: Mutex::new(channel),
            closed: AtomicBool::new(false),
        }))
    }

    fn new_connection(&self, _endpoint: &Arc<dyn SelectableEndpoint>, _context: ConnectContext) {}

    fn do_accept(&self, server: &TcpListener) -> io::Result<Option<TcpStream>> {
        self.accept_count.fetch_add(1, Ordering::SeqCst);
        if self.stall_next_accept.swap(false, Ordering::SeqCst) {
            self.entered_stall.open();
            self.release_stall.wait();
            return Ok(None);
        }
        match server.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn do_finish_connect(&self, _channel: &TcpStream) -> io::Result<bool> {
        self.finish_connect_calls.fetch_add(1, Ordering::SeqCst);
        match self.finish_connect {
            FinishConnect::AlwaysPending => Ok(false),
            FinishConnect::SucceedOnFirstCall => Ok(true),
        }
    }

    fn on_accepting(&self, _channel: &TcpStream) {
        self.on_accepting_count.fetch_add(1, Ordering::SeqCst);
    }

    fn on_accepted(&self, _channel: &TcpStream) {
        self.on_accepted_count.fetch_add(1, Ordering::SeqCst);
    }

    fn end_point_opened(&self, _endpoint: &Arc<dyn SelectableEndpoint>) {
        self.endpoints_opened.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_opened(&self, _endpoint: &Arc<dyn SelectableEndpoint>) {
        self.connections_opened.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_failed(&self, _channel: &TcpStream, cause: &SelectorError) {
        self.connections_failed.fetch_add(1, Ordering::SeqCst);
        *self.last_failure.lock().unwrap() = Some(cause.to_string());
    }

    fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn executor(&self) -> &dyn Executor {
        &self.executor
    }

    fn scheduler(&self) -> &dyn Scheduler {
        &self.scheduler
    }
}

/// Polls `condition` until it's true or `timeout` elapses, to observe
/// state that settles asynchronously via the producer's own thread.
fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn s1_start_stop_empty() {
    let manager = Arc::new(TestManager::new(Duration::from_secs(30), FinishConnect::AlwaysPending));
    let selector = ManagedSelector::new(manager.clone(), SelectorConfig::with_id(1)).unwrap();

    selector.start().unwrap();
    assert_eq!(manager.executor.submit_count.load(Ordering::SeqCst), 1);

    selector.stop().unwrap();
    // Idempotent: a second stop returns immediately without re-waiting.
    selector.stop().unwrap();

    // No work was ever produced, so the producer never handed itself
    // back to the executor beyond the initial dispatch.
    assert_eq!(manager.executor.submit_count.load(Ordering::SeqCst), 1);
}

#[test]
fn s3_accept_path_creates_three_endpoints_with_interest_none() {
    let manager = Arc::new(TestManager::new(Duration::from_secs(30), FinishConnect::AlwaysPending));
    let selector = ManagedSelector::new(manager.clone(), SelectorConfig::with_id(3)).unwrap();
    selector.start().unwrap();

    let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    let listener = TcpListener::from_std(std_listener);
    selector.accept(listener);

    for _ in 0..3 {
        let _client = std::net::TcpStream::connect(addr).unwrap();
        std::mem::forget(_client); // keep the socket open for the test's duration
    }

    assert!(wait_until(Duration::from_secs(2), || {
        manager.on_accepted_count.load(Ordering::SeqCst) == 3
    }));
    assert_eq!(manager.on_accepting_count.load(Ordering::SeqCst), 3);
    assert_eq!(manager.endpoints_opened.load(Ordering::SeqCst), 3);
    assert_eq!(manager.connections_opened.load(Ordering::SeqCst), 3);

    // 1 acceptor key plus the 3 accepted endpoints.
    assert!(wait_until(Duration::from_secs(2), || {
        selector.size() == 4
    }));

    let dump = selector.dump().unwrap();
    let endpoint_lines: Vec<&str> = dump.lines().filter(|l| l.contains("kind=endpoint")).collect();
    assert_eq!(endpoint_lines.len(), 3);
    assert!(endpoint_lines.iter().all(|l| l.contains("interest=None")));

    selector.stop().unwrap();
}

#[test]
fn s4_connect_timeout_closes_exactly_once() {
    let manager = Arc::new(TestManager::new(Duration::from_millis(50), FinishConnect::AlwaysPending));
    let selector = ManagedSelector::new(manager.clone(), SelectorConfig::with_id(4)).unwrap();
    selector.start().unwrap();

    // A real, bound-but-never-accepted listener: the client socket
    // completes its handshake at the OS level regardless, but this test's
    // `do_finish_connect` always reports "not yet", so only the timeout
    // can ever close it.
    let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std::mem::forget(std_listener);

    let channel = TcpStream::connect(addr).unwrap();
    selector.connect(channel);

    assert!(wait_until(Duration::from_millis(500), || {
        manager.connections_failed.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(manager.connections_failed.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.last_failure.lock().unwrap().as_deref(),
        Some(SelectorError::ConnectTimedOut.to_string().as_str())
    );

    selector.stop().unwrap();
}

#[test]
fn s5_connect_success_races_timeout() {
    // A generous timeout: on loopback the connect resolves almost
    // immediately, well before this would ever fire.
    let manager = Arc::new(TestManager::new(Duration::from_secs(5), FinishConnect::SucceedOnFirstCall));
    let selector = ManagedSelector::new(manager.clone(), SelectorConfig::with_id(5)).unwrap();
    selector.start().unwrap();

    let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std::mem::forget(std_listener);

    let channel = TcpStream::connect(addr).unwrap();
    selector.connect(channel);

    assert!(wait_until(Duration::from_secs(2), || {
        manager.endpoints_opened.load(Ordering::SeqCst) == 1
    }));
    assert!(manager.finish_connect_calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(manager.connections_opened.load(Ordering::SeqCst), 1);
    assert_eq!(manager.connections_failed.load(Ordering::SeqCst), 0);

    selector.stop().unwrap();
}

#[test]
fn s6_dump_reports_live_endpoints_and_pending_updates() {
    let manager = Arc::new(TestManager::new(Duration::from_secs(30), FinishConnect::AlwaysPending));
    let selector = ManagedSelector::new(manager.clone(), SelectorConfig::with_id(6)).unwrap();
    selector.start().unwrap();

    let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    let listener = TcpListener::from_std(std_listener);
    selector.accept(listener);

    for _ in 0..10 {
        let client = std::net::TcpStream::connect(addr).unwrap();
        std::mem::forget(client);
    }

    assert!(wait_until(Duration::from_secs(2), || {
        manager.endpoints_opened.load(Ordering::SeqCst) == 10
    }));
    // 1 acceptor key plus the 10 accepted endpoints.
    assert!(wait_until(Duration::from_secs(2), || selector.size() == 11));

    // Pin the producer inside `do_accept` (reached from `process_keys`,
    // well before `ApplyingUpdates`) on one more connection, so it cannot
    // drain the queue until we say so. Without this, the three no-op
    // updates below could be applied by the producer before `dump`'s
    // pending-updates snapshot ever looks at the queue.
    manager.stall_next_accept.store(true, Ordering::SeqCst);
    let _extra_client = std::net::TcpStream::connect(addr).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        manager.entered_stall.is_open()
    }));

    // Three harmless no-op interest changes (no endpoint owns these
    // tokens) occupy the pending-updates queue at the moment of dump.
    // The producer is stalled in `do_accept` and cannot have touched the
    // queue yet, so these are guaranteed still pending.
    for i in 0..3 {
        selector.modify_interest(Token(9_000 + i), Interest::READABLE);
    }

    // Release the stall only after `dump`'s own thread has had ample time
    // to call in and take its pending-updates snapshot (the first thing
    // `dump` does, well before it waits on the producer at all).
    let release_stall = &manager.release_stall;
    thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            release_stall.open();
        });
        let dump = selector.dump().unwrap();

        let key_lines: Vec<&str> = dump.lines().filter(|l| l.contains("kind=endpoint")).collect();
        assert_eq!(key_lines.len(), 10);
        assert!(key_lines.iter().all(|l| l.contains('[') && l.contains('T')));

        let summary = dump.lines().find(|l| l.starts_with("pending updates")).unwrap();
        assert!(summary.starts_with("pending updates (3)"));
    });

    selector.stop().unwrap();
}
