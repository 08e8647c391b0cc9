use async_std::future::timeout;
use async_std::net::{TcpListener, TcpStream};
use connset::{channel, AsyncCloseable, Channel, ChannelIo, CompletionSignal};
use connset::{ConnectionSet, Error, ListenableAsyncCloseable, Offload};
use futures_util::{AsyncReadExt, AsyncWriteExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How long the server accepts connections before shutting down.
const RUN_FOR: Duration = Duration::from_secs(30);

/// Upper bound on the graceful part of the shutdown.
const DRAIN_FOR: Duration = Duration::from_secs(5);

#[async_std::main]
async fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let l = TcpListener::bind("127.0.0.1:3000").await?;
    println!("Listening to {:?}", l.local_addr()?);

    let set = ConnectionSet::new(Offload::thread_pool()?);

    timeout(RUN_FOR, listen(&l, &set)).await.ok();

    println!("Shutting down {} connections", set.len());

    match timeout(DRAIN_FOR, set.close_async_gracefully().wait()).await {
        Ok(r) => r?,
        Err(_) => {
            println!("Drain timed out, force closing");
            set.close_async().wait().await?;
        }
    }

    println!("All connections closed");

    Ok(())
}

async fn listen(l: &TcpListener, set: &ConnectionSet<Channel>) {
    loop {
        let (tcp, _) = match l.accept().await {
            Ok(v) => v,
            Err(_) => continue,
        };

        let (handle, io) = channel(tcp);

        let session = Arc::new(EchoSession {
            channel: handle.clone(),
            draining: Arc::new(AtomicBool::new(false)),
        });
        handle.set_session(session.clone());

        if !set.add(handle) {
            continue;
        }

        async_std::task::spawn(echo(io, session.draining.clone()));
    }
}

/// Echo line by line. Once draining, finish the current line and stop.
async fn echo(mut io: ChannelIo<TcpStream>, draining: Arc<AtomicBool>) {
    let mut buf = vec![0_u8; 1024];

    loop {
        let n = match io.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        if io.write_all(&buf[..n]).await.is_err() {
            break;
        }

        let end_of_line = buf[..n].ends_with(b"\n");

        if end_of_line && draining.load(Ordering::SeqCst) {
            io.close().await.ok();
            break;
        }
    }
}

struct EchoSession {
    channel: Channel,
    draining: Arc<AtomicBool>,
}

impl AsyncCloseable for EchoSession {
    fn close_async(&self) -> CompletionSignal {
        self.channel.close();
        self.channel.close_future()
    }

    fn close_async_gracefully(&self) -> CompletionSignal {
        self.draining.store(true, Ordering::SeqCst);
        self.channel.close_future()
    }
}

impl ListenableAsyncCloseable for EchoSession {
    fn on_close(&self) -> CompletionSignal {
        self.channel.close_future()
    }
}
