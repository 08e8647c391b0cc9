#![no_main]
use libfuzzer_sys::fuzz_target;

use connset::{CompletionSignal, Connection, ConnectionSet, ListenableAsyncCloseable, Offload};
use connset::AsyncCloseable;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone)]
struct Conn {
    id: u8,
    closed: CompletionSignal,
    session: Option<Arc<Session>>,
}

struct Session {
    drained: CompletionSignal,
    closed: CompletionSignal,
}

impl AsyncCloseable for Session {
    fn close_async(&self) -> CompletionSignal {
        self.closed.complete();
        self.drained.complete();
        self.drained.clone()
    }

    fn close_async_gracefully(&self) -> CompletionSignal {
        self.drained.clone()
    }
}

impl ListenableAsyncCloseable for Session {
    fn on_close(&self) -> CompletionSignal {
        self.closed.clone()
    }
}

impl Connection for Conn {
    type Id = u8;

    fn id(&self) -> u8 {
        self.id
    }

    fn close(&self) {
        self.closed.complete();
    }

    fn close_future(&self) -> CompletionSignal {
        self.closed.clone()
    }

    fn session(&self) -> Option<Arc<dyn ListenableAsyncCloseable>> {
        self.session
            .clone()
            .map(|s| s as Arc<dyn ListenableAsyncCloseable>)
    }
}

// Each byte is an op: low 2 bits pick the op, the rest a connection slot.
fuzz_target!(|data: &[u8]| {
    let set = ConnectionSet::new(Offload::immediate());

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    set.on_close().subscribe(move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    });

    let mut conns: Vec<Conn> = vec![];

    for b in data {
        let slot = b >> 2;
        match b & 0b11 {
            0 => {
                let closed = CompletionSignal::new();
                let session = if slot % 2 == 0 {
                    Some(Arc::new(Session {
                        drained: CompletionSignal::new(),
                        closed: closed.clone(),
                    }))
                } else {
                    None
                };
                let c = Conn {
                    id: slot,
                    closed,
                    session,
                };
                set.add(c.clone());
                conns.push(c);
            }
            1 => {
                if let Some(c) = conns.iter().find(|c| c.id == slot) {
                    c.closed.complete();
                }
            }
            2 => {
                set.close_async_gracefully();
            }
            _ => {
                set.close_async();
            }
        }
    }

    set.close_async();

    // Every tracked connection got force closed, so the set must be empty and
    // have fired exactly once.
    assert!(set.is_empty());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
});
