#![allow(dead_code)]

use async_std::net::{TcpListener, TcpStream};
use connset::{AsyncCloseable, CompletionSignal, Connection, Error};
use connset::{Executor, ListenableAsyncCloseable, Task};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("connset", level)
            .target(env_logger::Target::Stdout)
            .init();
    });
}

/// In-memory connection. `close()` closes the "transport" right away.
#[derive(Clone)]
pub struct MockConn(Arc<MockInner>);

struct MockInner {
    id: u32,
    closed: CompletionSignal,
    close_calls: AtomicUsize,
    session: Mutex<Option<Arc<dyn ListenableAsyncCloseable>>>,
}

impl MockConn {
    pub fn new(id: u32) -> Self {
        MockConn(Arc::new(MockInner {
            id,
            closed: CompletionSignal::new(),
            close_calls: AtomicUsize::new(0),
            session: Mutex::new(None),
        }))
    }

    /// Number of times the set (or anything else) asked for a force close.
    pub fn close_calls(&self) -> usize {
        self.0.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.is_done()
    }

    /// The peer went away.
    pub fn remote_close(&self) {
        self.0.closed.complete();
    }
}

impl Connection for MockConn {
    type Id = u32;

    fn id(&self) -> u32 {
        self.0.id
    }

    fn close(&self) {
        self.0.close_calls.fetch_add(1, Ordering::SeqCst);
        self.0.closed.complete();
    }

    fn close_future(&self) -> CompletionSignal {
        self.0.closed.clone()
    }

    fn session(&self) -> Option<Arc<dyn ListenableAsyncCloseable>> {
        self.0.session.lock().unwrap().clone()
    }
}

/// Session whose drain finishes when the test says so.
pub struct MockSession {
    conn: MockConn,
    drained: CompletionSignal,
    graceful_calls: AtomicUsize,
}

impl MockSession {
    pub fn attach(conn: &MockConn) -> Arc<MockSession> {
        let session = Arc::new(MockSession {
            conn: conn.clone(),
            drained: CompletionSignal::new(),
            graceful_calls: AtomicUsize::new(0),
        });
        *conn.0.session.lock().unwrap() = Some(session.clone());
        session
    }

    pub fn graceful_calls(&self) -> usize {
        self.graceful_calls.load(Ordering::SeqCst)
    }

    /// In-flight work is done, close the transport.
    pub fn finish_drain(&self) {
        self.conn.0.closed.complete();
        self.drained.complete();
    }

    /// In-flight work is done, but the transport is left for someone else to close.
    pub fn report_drained(&self) {
        self.drained.complete();
    }

    pub fn fail_drain(&self, msg: &str) {
        self.drained.fail(Error::Participant(msg.into()));
    }
}

impl AsyncCloseable for MockSession {
    fn close_async(&self) -> CompletionSignal {
        self.finish_drain();
        self.drained.clone()
    }

    fn close_async_gracefully(&self) -> CompletionSignal {
        self.graceful_calls.fetch_add(1, Ordering::SeqCst);
        self.drained.clone()
    }
}

impl ListenableAsyncCloseable for MockSession {
    fn on_close(&self) -> CompletionSignal {
        self.conn.close_future()
    }
}

/// Participant recording the close requests it receives.
pub struct Recorder {
    pub name: &'static str,
    pub signal: CompletionSignal,
    now: AtomicUsize,
    graceful: AtomicUsize,
    log: Option<Arc<Mutex<Vec<&'static str>>>>,
}

impl Recorder {
    pub fn new(name: &'static str) -> Arc<Recorder> {
        Recorder::build(name, None)
    }

    pub fn logging(name: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Recorder> {
        Recorder::build(name, Some(log))
    }

    fn build(name: &'static str, log: Option<Arc<Mutex<Vec<&'static str>>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            name,
            signal: CompletionSignal::new(),
            now: AtomicUsize::new(0),
            graceful: AtomicUsize::new(0),
            log,
        })
    }

    pub fn now_calls(&self) -> usize {
        self.now.load(Ordering::SeqCst)
    }

    pub fn graceful_calls(&self) -> usize {
        self.graceful.load(Ordering::SeqCst)
    }

    fn record(&self) {
        if let Some(log) = &self.log {
            log.lock().unwrap().push(self.name);
        }
    }
}

impl AsyncCloseable for Recorder {
    fn close_async(&self) -> CompletionSignal {
        self.now.fetch_add(1, Ordering::SeqCst);
        self.record();
        self.signal.clone()
    }

    fn close_async_gracefully(&self) -> CompletionSignal {
        self.graceful.fetch_add(1, Ordering::SeqCst);
        self.record();
        self.signal.clone()
    }
}

/// Executor running every task on a new thread, counting them.
#[derive(Clone, Default)]
pub struct ThreadExecutor {
    spawned: Arc<AtomicUsize>,
}

impl ThreadExecutor {
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Task) {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        thread::spawn(task);
    }
}

/// Counts how many times a signal delivered to its observer.
pub fn count_deliveries(signal: &CompletionSignal) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    signal.subscribe(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    count
}

/// Connected TCP pairs, (server side, client side).
pub async fn tcp_pairs(n: usize) -> std::io::Result<Vec<(TcpStream, TcpStream)>> {
    setup_logger();

    let l = TcpListener::bind("127.0.0.1:0").await?;
    let addr = l.local_addr()?;

    let mut pairs = vec![];

    for _ in 0..n {
        let client = TcpStream::connect(addr).await?;
        let (server, _) = l.accept().await?;
        pairs.push((server, client));
    }

    Ok(pairs)
}
