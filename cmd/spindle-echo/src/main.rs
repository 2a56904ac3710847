//! Spindle Echo Server
//!
//! TCP echo server driven by the spindle accepting reactor: one polling
//! thread classifies readiness, a bounded worker pool runs the echo
//! handlers.
//!
//! Usage:
//!     cargo run --release -p spindle-echo [port]
//!
//! With a port, serves until killed:
//!     echo "hello" | nc localhost 9999
//!
//! Without a port, binds an ephemeral port, round-trips one message
//! through a loopback client, and exits.

use spindle_core::worker::TaskPool;
use spindle_pool::FixedPool;
use spindle_reactor::{
    ChannelHandler, HandlerFactory, ReactorShared, Registration, ServerReactor, SocketOptions,
    TraceSink,
};

use mio::net::TcpStream;

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const BUF_SIZE: usize = 4096;

struct EchoHandler {
    channel: Mutex<TcpStream>,
    reactor: Arc<ReactorShared>,
    reg: Registration,
    peer: SocketAddr,
}

impl ChannelHandler for EchoHandler {
    fn channel(&self) -> MutexGuard<'_, TcpStream> {
        self.channel.lock().expect("channel poisoned")
    }

    fn connected(self: Arc<Self>) {
        tracing::debug!(peer = %self.peer, "connection up");
    }

    fn readable(self: Arc<Self>) {
        let mut buf = [0u8; BUF_SIZE];
        let mut closed = false;
        {
            let mut channel = self.channel();
            loop {
                match channel.read(&mut buf) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => {
                        if channel.write_all(&buf[..n]).is_err() {
                            closed = true;
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }
        }
        if closed {
            let mut channel = self.channel();
            self.reactor.cancel(self.reg, &mut *channel);
            tracing::debug!(peer = %self.peer, "connection down");
        }
    }

    fn writable(self: Arc<Self>) {}
}

struct EchoFactory;

impl HandlerFactory for EchoFactory {
    fn create(
        &self,
        channel: TcpStream,
        peer: SocketAddr,
        reactor: Arc<ReactorShared>,
        reg: Registration,
    ) -> Arc<dyn ChannelHandler> {
        Arc::new(EchoHandler {
            channel: Mutex::new(channel),
            reactor,
            reg,
            peer,
        })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let port: u16 = std::env::args()
        .nth(1)
        .map(|p| p.parse())
        .transpose()?
        .unwrap_or(0);
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;

    let pool = Arc::new(FixedPool::auto_sized(1024));
    let mut server = ServerReactor::bind(
        SocketOptions::from_env(),
        addr,
        pool.clone(),
        Arc::new(EchoFactory),
        Arc::new(TraceSink),
    )?;
    tracing::info!(addr = %server.local_addr(), workers = pool.total_workers(), "echo server up");

    if port != 0 {
        // Serve until killed.
        loop {
            std::thread::park();
        }
    }

    // Self-test: one round trip through a plain blocking client.
    let mut client = std::net::TcpStream::connect(server.local_addr())?;
    client.set_read_timeout(Some(Duration::from_secs(5)))?;
    client.write_all(b"hello spindle\n")?;
    let mut buf = [0u8; BUF_SIZE];
    let n = client.read(&mut buf)?;
    print!("{}", String::from_utf8_lossy(&buf[..n]));
    drop(client);

    server.shutdown()?;
    pool.shutdown();
    Ok(())
}
