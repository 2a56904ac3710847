//! # Accepting reactor — listen, accept, connect orchestration
//!
//! Specializes the poll-loop engine for a listening socket. Accept
//! readiness drains the whole backlog into fresh handlers; connect
//! readiness finishes outbound attempts and hands the completion action
//! to the worker pool.
//!
//! Classification of one ready key checks accept, then read, then write,
//! then connect — first match wins. A key is not expected to present more
//! than one actionable bit at once; if it does, the losing bit resurfaces
//! on a later poll if still relevant.

use crate::engine::{
    Dispatch, Reactor, ReactorConfig, ReactorShared, Registration, Routed, LISTENER_TOKEN,
};
use crate::handler::{Attachment, ChannelHandler, ConnectPending, HandlerFactory};
use crate::interest::InterestSet;
use crate::options::{self, SocketOptions};

use spindle_core::completion::Completion;
use spindle_core::diag::{Diagnostic, DiagnosticSink};
use spindle_core::error::{Error, Result};
use spindle_core::worker::{Action, TaskPool};

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::Token;

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

/// A freshly initiated outbound connection.
pub struct Outbound {
    pub handler: Arc<dyn ChannelHandler>,
    /// Completed once the handler's `connected` callback has run —
    /// through the same token whether the handshake finished inside
    /// `connect_to` or via the poll loop.
    pub established: Completion,
}

/// Reactor variant that owns a listening channel.
pub struct ServerReactor {
    state: Arc<ServerState>,
    reactor: Reactor,
}

struct ServerState {
    listener: TcpListener,
    local_addr: SocketAddr,
    options: SocketOptions,
    pool: Arc<dyn TaskPool>,
    factory: Arc<dyn HandlerFactory>,
    shared: Arc<ReactorShared>,
}

impl ServerReactor {
    /// Bind a listening channel and start the polling thread.
    pub fn bind(
        options: SocketOptions,
        local: SocketAddr,
        pool: Arc<dyn TaskPool>,
        factory: Arc<dyn HandlerFactory>,
        diag: Arc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        let listener = options::bind_listener(&options, local)?;
        Self::start(listener, options, pool, factory, diag)
    }

    /// Wrap a listener the caller bound ahead of time.
    pub fn with_listener(
        listener: std::net::TcpListener,
        options: SocketOptions,
        pool: Arc<dyn TaskPool>,
        factory: Arc<dyn HandlerFactory>,
        diag: Arc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        listener.set_nonblocking(true).map_err(Error::Bind)?;
        Self::start(TcpListener::from_std(listener), options, pool, factory, diag)
    }

    fn start(
        mut listener: TcpListener,
        options: SocketOptions,
        pool: Arc<dyn TaskPool>,
        factory: Arc<dyn HandlerFactory>,
        diag: Arc<dyn DiagnosticSink>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr().map_err(Error::Bind)?;
        let (poll, shared) = Reactor::setup(diag)?;
        shared.register_listener(&mut listener)?;
        let state = Arc::new(ServerState {
            listener,
            local_addr,
            options,
            pool,
            factory,
            shared: shared.clone(),
        });
        let reactor = Reactor::start(ReactorConfig::default(), poll, shared, state.clone());
        Ok(Self { state, reactor })
    }

    /// Address the listening channel is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.state.local_addr
    }

    /// Handle to the shared state, for registrations and wakeups.
    pub fn shared(&self) -> Arc<ReactorShared> {
        self.state.shared.clone()
    }

    /// Initiate an outbound connection.
    ///
    /// When the OS completes the handshake inside the call, the handler's
    /// `connected` callback runs synchronously before this returns.
    /// Otherwise the channel is registered for connect readiness and the
    /// poll loop is woken; establishment is observed through
    /// [`Outbound::established`].
    pub fn connect_to(&self, remote: SocketAddr) -> Result<Outbound> {
        self.state.connect_to(remote)
    }

    /// Stop the polling thread and close the remaining channels.
    pub fn shutdown(&mut self) -> Result<()> {
        self.reactor.shutdown()
    }
}

impl ServerState {
    fn connect_to(&self, remote: SocketAddr) -> Result<Outbound> {
        if self.shared.is_shut_down() {
            return Err(Error::Shutdown);
        }
        let (channel, connected_now) = options::connect_stream(&self.options, remote)?;
        let reg = self.shared.allocate();
        let handler = self
            .factory
            .create(channel, remote, self.shared.clone(), reg);

        let established = Completion::new();
        let completion = established.clone();
        let callback_handler = handler.clone();
        let action: Action = Box::new(move || {
            callback_handler.connected();
            completion.complete();
        });

        if connected_now {
            // Established in the calling context; no poll round-trip.
            action();
            return Ok(Outbound {
                handler,
                established,
            });
        }

        {
            let mut channel = handler.channel();
            self.shared.register(
                reg,
                &mut *channel,
                Attachment::ConnectCallback(ConnectPending {
                    handler: handler.clone(),
                    peer: remote,
                    action,
                }),
                InterestSet::WRITE,
            )?;
        }
        self.shared.wakeup();
        Ok(Outbound {
            handler,
            established,
        })
    }

    fn handle_accept(&self) {
        loop {
            match self.listener.accept() {
                Ok((channel, peer)) => self.admit(channel, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.raw_os_error() == Some(libc::ECONNABORTED) => continue,
                Err(error) => {
                    // One failed accept drops that connection, not the
                    // listener; readiness re-fires if the backlog refills.
                    self.shared.diag().report(Diagnostic::AcceptFailed { error });
                    break;
                }
            }
        }
    }

    fn admit(&self, channel: TcpStream, peer: SocketAddr) {
        if let Err(error) = self.options.configure(channel.as_raw_fd()) {
            self.shared.diag().report(Diagnostic::AcceptFailed { error });
            return;
        }
        let reg = self.shared.allocate();
        let handler = self.factory.create(channel, peer, self.shared.clone(), reg);
        {
            let mut channel = handler.channel();
            if self
                .shared
                .register(
                    reg,
                    &mut *channel,
                    Attachment::Handler(handler.clone()),
                    InterestSet::READ,
                )
                .is_err()
            {
                // The connection vanished under us; nothing to promote.
                self.shared
                    .diag()
                    .report(Diagnostic::RegistrationRaced { token: reg.token() });
                return;
            }
        }
        let connected = handler.clone();
        self.submit_or_report(reg.token(), Box::new(move || connected.connected()));
    }

    fn handle_connect(&self, token: Token, pending: ConnectPending) {
        let ConnectPending {
            handler,
            peer,
            action,
        } = pending;
        {
            let mut channel = handler.channel();
            // Connect interest is one-shot: the key goes away first,
            // whatever the outcome.
            self.shared.deregister_channel(token, &mut *channel);
            if let Err(error) = finish_connect(&channel) {
                self.shared
                    .diag()
                    .report(Diagnostic::ConnectFailed { peer, error });
                return;
            }
        }
        self.submit_or_report(token.0, action);
    }

    /// Fire-and-forget handoff. A rejected action is reported at the
    /// finest level and dropped: no retry, no error to the poll loop.
    fn submit_or_report(&self, token: usize, action: Action) {
        if self.pool.submit(action).is_err() {
            self.shared
                .diag()
                .report(Diagnostic::SubmissionRejected { token });
        }
    }
}

/// Collect the outcome of an asynchronous handshake.
fn finish_connect(channel: &TcpStream) -> io::Result<()> {
    // SO_ERROR carries the result; a clear flag plus a peer address means
    // the channel is established.
    if let Some(e) = channel.take_error()? {
        return Err(e);
    }
    channel.peer_addr()?;
    Ok(())
}

impl Dispatch for Arc<ServerState> {
    fn dispatch(&self, event: &Event) {
        // Accept, then read, then write, then connect.
        if event.token() == LISTENER_TOKEN {
            self.handle_accept();
            return;
        }
        match self.shared.route(event.token()) {
            Some(Routed::Handler(handler)) => {
                let token = event.token().0;
                if event.is_readable() {
                    self.submit_or_report(token, Box::new(move || handler.readable()));
                } else if event.is_writable() {
                    self.submit_or_report(token, Box::new(move || handler.writable()));
                } else {
                    // Hang-up and error-only notifications surface through
                    // the read path.
                    self.submit_or_report(token, Box::new(move || handler.readable()));
                }
            }
            Some(Routed::Connect(pending)) => self.handle_connect(event.token(), pending),
            None => {
                // The handler closed its own channel between wakeup and
                // inspection. Normal, not an error.
                self.shared
                    .diag()
                    .report(Diagnostic::CancelledKey {
                        token: event.token().0,
                    });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_pool::FixedPool;

    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex, MutexGuard};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().expect("bad loopback addr")
    }

    // ── Diagnostic and pool test doubles ─────────────────────────────

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn count(&self, needle: &str) -> usize {
            self.events
                .lock()
                .expect("sink poisoned")
                .iter()
                .filter(|e| e.contains(needle))
                .count()
        }
    }

    impl DiagnosticSink for RecordingSink {
        fn report(&self, event: Diagnostic) {
            self.events
                .lock()
                .expect("sink poisoned")
                .push(format!("{:?}", event));
        }
    }

    struct RejectingPool;

    impl TaskPool for RejectingPool {
        fn submit(&self, _action: Action) -> Result<()> {
            Err(Error::SubmissionRejected)
        }
        fn active_workers(&self) -> usize {
            0
        }
        fn total_workers(&self) -> usize {
            0
        }
        fn shutdown(&self) {}
    }

    // ── Echo server side ─────────────────────────────────────────────

    #[derive(Default)]
    struct EchoProbe {
        creations: AtomicUsize,
        connects: AtomicUsize,
        peers: Mutex<Vec<SocketAddr>>,
    }

    struct EchoFactory {
        probe: Arc<EchoProbe>,
    }

    struct EchoHandler {
        channel: Mutex<TcpStream>,
        probe: Arc<EchoProbe>,
    }

    impl HandlerFactory for EchoFactory {
        fn create(
            &self,
            channel: TcpStream,
            peer: SocketAddr,
            _reactor: Arc<ReactorShared>,
            _reg: Registration,
        ) -> Arc<dyn ChannelHandler> {
            self.probe.creations.fetch_add(1, Ordering::SeqCst);
            self.probe.peers.lock().expect("peers poisoned").push(peer);
            Arc::new(EchoHandler {
                channel: Mutex::new(channel),
                probe: self.probe.clone(),
            })
        }
    }

    impl ChannelHandler for EchoHandler {
        fn channel(&self) -> MutexGuard<'_, TcpStream> {
            self.channel.lock().expect("channel poisoned")
        }

        fn connected(self: Arc<Self>) {
            self.probe.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn readable(self: Arc<Self>) {
            let mut channel = self.channel();
            let mut buf = [0u8; 1024];
            loop {
                match channel.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let _ = channel.write_all(&buf[..n]);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }

        fn writable(self: Arc<Self>) {}
    }

    fn echo_server(pool: Arc<dyn TaskPool>) -> (ServerReactor, Arc<EchoProbe>) {
        let probe = Arc::new(EchoProbe::default());
        let server = ServerReactor::bind(
            SocketOptions::default(),
            loopback(),
            pool,
            Arc::new(EchoFactory {
                probe: probe.clone(),
            }),
            Arc::new(RecordingSink::default()),
        )
        .expect("echo server bind failed");
        (server, probe)
    }

    // ── Client side ──────────────────────────────────────────────────

    struct ClientProbe {
        payload: Vec<u8>,
        /// Write + rearm for read inside `connected`.
        rearm: bool,
        connects: AtomicUsize,
        data_tx: Mutex<mpsc::Sender<Vec<u8>>>,
        regs: Mutex<Vec<Registration>>,
    }

    struct ClientFactory {
        probe: Arc<ClientProbe>,
    }

    struct ClientHandler {
        channel: Mutex<TcpStream>,
        reactor: Arc<ReactorShared>,
        reg: Registration,
        probe: Arc<ClientProbe>,
    }

    impl HandlerFactory for ClientFactory {
        fn create(
            &self,
            channel: TcpStream,
            _peer: SocketAddr,
            reactor: Arc<ReactorShared>,
            reg: Registration,
        ) -> Arc<dyn ChannelHandler> {
            self.probe.regs.lock().expect("regs poisoned").push(reg);
            Arc::new(ClientHandler {
                channel: Mutex::new(channel),
                reactor,
                reg,
                probe: self.probe.clone(),
            })
        }
    }

    impl ChannelHandler for ClientHandler {
        fn channel(&self) -> MutexGuard<'_, TcpStream> {
            self.channel.lock().expect("channel poisoned")
        }

        fn connected(self: Arc<Self>) {
            self.probe.connects.fetch_add(1, Ordering::SeqCst);
            if !self.probe.rearm {
                return;
            }
            {
                let mut channel = self.channel();
                let _ = channel.write_all(&self.probe.payload);
            }
            let attachment = Attachment::Handler(self.clone() as Arc<dyn ChannelHandler>);
            let mut channel = self.channel();
            let _ = self
                .reactor
                .register(self.reg, &mut *channel, attachment, InterestSet::READ);
        }

        fn readable(self: Arc<Self>) {
            let mut collected = Vec::new();
            {
                let mut channel = self.channel();
                let mut buf = [0u8; 1024];
                loop {
                    match channel.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => collected.extend_from_slice(&buf[..n]),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(_) => break,
                    }
                }
            }
            if !collected.is_empty() {
                let _ = self
                    .probe
                    .data_tx
                    .lock()
                    .expect("data channel poisoned")
                    .send(collected);
            }
        }

        fn writable(self: Arc<Self>) {}
    }

    fn client_reactor(
        payload: &[u8],
        rearm: bool,
        pool: Arc<dyn TaskPool>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> (ServerReactor, Arc<ClientProbe>, mpsc::Receiver<Vec<u8>>) {
        let (data_tx, data_rx) = mpsc::channel();
        let probe = Arc::new(ClientProbe {
            payload: payload.to_vec(),
            rearm,
            connects: AtomicUsize::new(0),
            data_tx: Mutex::new(data_tx),
            regs: Mutex::new(Vec::new()),
        });
        let reactor = ServerReactor::bind(
            SocketOptions::default(),
            loopback(),
            pool,
            Arc::new(ClientFactory {
                probe: probe.clone(),
            }),
            sink,
        )
        .expect("client reactor bind failed");
        (reactor, probe, data_rx)
    }

    // ── Tests ────────────────────────────────────────────────────────

    #[test]
    fn echo_round_trip() {
        let pool: Arc<dyn TaskPool> = Arc::new(FixedPool::new(2, 64));
        let (mut server, server_probe) = echo_server(pool.clone());
        let (mut client, client_probe, data_rx) = client_reactor(
            b"spindle echo\n",
            true,
            pool.clone(),
            Arc::new(RecordingSink::default()),
        );

        let outbound = client
            .connect_to(server.local_addr())
            .expect("connect_to failed");
        assert!(
            outbound.established.wait_timeout(Duration::from_secs(5)),
            "connect never completed"
        );

        let echoed = data_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("no echo received");
        assert_eq!(echoed, b"spindle echo\n".to_vec());

        // Establishment callbacks ran exactly once on each side.
        assert_eq!(client_probe.connects.load(Ordering::SeqCst), 1);
        assert!(wait_for(
            || server_probe.connects.load(Ordering::SeqCst) == 1,
            Duration::from_secs(5)
        ));

        client.shutdown().expect("client shutdown failed");
        server.shutdown().expect("server shutdown failed");
        pool.shutdown();
    }

    #[test]
    fn burst_of_accepts_creates_distinct_handlers() {
        const CLIENTS: usize = 8;
        let pool: Arc<dyn TaskPool> = Arc::new(FixedPool::new(2, 64));
        let (mut server, probe) = echo_server(pool.clone());
        let addr = server.local_addr();

        let mut streams = Vec::with_capacity(CLIENTS);
        for _ in 0..CLIENTS {
            streams.push(std::net::TcpStream::connect(addr).expect("client connect failed"));
        }

        assert!(
            wait_for(
                || probe.creations.load(Ordering::SeqCst) == CLIENTS,
                Duration::from_secs(5)
            ),
            "expected {} handlers, saw {}",
            CLIENTS,
            probe.creations.load(Ordering::SeqCst)
        );

        // Every handler saw a distinct peer.
        let peers = probe.peers.lock().expect("peers poisoned");
        let mut unique: Vec<_> = peers.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), CLIENTS);

        drop(streams);
        server.shutdown().expect("server shutdown failed");
        pool.shutdown();
    }

    #[test]
    fn refused_connect_never_promotes_and_reactor_stays_live() {
        let pool: Arc<dyn TaskPool> = Arc::new(FixedPool::new(2, 64));
        let (mut server, _server_probe) = echo_server(pool.clone());

        let sink = Arc::new(RecordingSink::default());
        let (mut client, probe, _data_rx) =
            client_reactor(b"unused", false, pool.clone(), sink.clone());

        // A freshly released ephemeral port refuses connections.
        let dead_addr = {
            let throwaway = std::net::TcpListener::bind(loopback()).expect("bind failed");
            throwaway.local_addr().expect("no local addr")
        };

        match client.connect_to(dead_addr) {
            // Loopback may refuse synchronously inside the connect call.
            Err(Error::Connect(_)) => {}
            Ok(outbound) => {
                assert!(
                    !outbound.established.wait_timeout(Duration::from_secs(2)),
                    "refused connect reported as established"
                );
                assert!(
                    wait_for(|| sink.count("ConnectFailed") > 0, Duration::from_secs(5)),
                    "connect failure never reported"
                );
                assert_eq!(probe.connects.load(Ordering::SeqCst), 0);
            }
            Err(e) => panic!("unexpected connect error: {}", e),
        }

        // The same reactor still serves new attempts.
        let outbound = client
            .connect_to(server.local_addr())
            .expect("follow-up connect failed");
        assert!(
            outbound.established.wait_timeout(Duration::from_secs(5)),
            "follow-up connect never completed"
        );

        client.shutdown().expect("client shutdown failed");
        server.shutdown().expect("server shutdown failed");
        pool.shutdown();
    }

    #[test]
    fn pool_rejection_is_swallowed_and_loop_continues() {
        let sink = Arc::new(RecordingSink::default());
        let probe = Arc::new(EchoProbe::default());
        let mut server = ServerReactor::bind(
            SocketOptions::default(),
            loopback(),
            Arc::new(RejectingPool),
            Arc::new(EchoFactory {
                probe: probe.clone(),
            }),
            sink.clone(),
        )
        .expect("server bind failed");
        let addr = server.local_addr();

        let _a = std::net::TcpStream::connect(addr).expect("first connect failed");
        assert!(wait_for(
            || probe.creations.load(Ordering::SeqCst) >= 1,
            Duration::from_secs(5)
        ));
        assert!(wait_for(
            || sink.count("SubmissionRejected") >= 1,
            Duration::from_secs(5)
        ));

        // A later, unrelated readiness event is still dispatched.
        let _b = std::net::TcpStream::connect(addr).expect("second connect failed");
        assert!(wait_for(
            || probe.creations.load(Ordering::SeqCst) >= 2,
            Duration::from_secs(5)
        ));
        // Nothing ever ran on the rejecting pool.
        assert_eq!(probe.connects.load(Ordering::SeqCst), 0);

        server.shutdown().expect("server shutdown failed");
    }

    #[test]
    fn connect_interest_is_consumed_once() {
        let pool: Arc<dyn TaskPool> = Arc::new(FixedPool::new(2, 64));
        let (mut server, _probe) = echo_server(pool.clone());
        let (mut client, probe, _data_rx) = client_reactor(
            b"unused",
            false,
            pool.clone(),
            Arc::new(RecordingSink::default()),
        );

        let outbound = client
            .connect_to(server.local_addr())
            .expect("connect_to failed");
        assert!(outbound.established.wait_timeout(Duration::from_secs(5)));
        assert_eq!(probe.connects.load(Ordering::SeqCst), 1);

        // The connect key is gone: the quiet handler never re-registered,
        // so the channel has no registration at all any more.
        let reg = probe.regs.lock().expect("regs poisoned")[0];
        let shared = client.shared();
        assert!(wait_for(
            || !shared.is_registered(reg),
            Duration::from_secs(5)
        ));
        assert_eq!(shared.registration_count(), 0);

        client.shutdown().expect("client shutdown failed");
        server.shutdown().expect("server shutdown failed");
        pool.shutdown();
    }

    #[test]
    fn cross_thread_registration_becomes_live_promptly() {
        let pool: Arc<dyn TaskPool> = Arc::new(FixedPool::new(2, 64));
        let (mut server, _probe) = echo_server(pool.clone());
        let shared = server.shared();

        // A plain blocking client, wrapped and registered from this thread
        // while the poll loop is already blocked.
        let std_stream =
            std::net::TcpStream::connect(server.local_addr()).expect("connect failed");
        std_stream
            .set_nonblocking(true)
            .expect("set_nonblocking failed");
        let (data_tx, data_rx) = mpsc::channel();
        let probe = Arc::new(ClientProbe {
            payload: Vec::new(),
            rearm: false,
            connects: AtomicUsize::new(0),
            data_tx: Mutex::new(data_tx),
            regs: Mutex::new(Vec::new()),
        });
        let reg = shared.allocate();
        let handler = Arc::new(ClientHandler {
            channel: Mutex::new(TcpStream::from_std(std_stream)),
            reactor: shared.clone(),
            reg,
            probe,
        });
        {
            let mut channel = handler.channel();
            shared
                .register(
                    reg,
                    &mut *channel,
                    Attachment::Handler(handler.clone() as Arc<dyn ChannelHandler>),
                    InterestSet::READ,
                )
                .expect("register failed");
        }
        shared.wakeup();

        {
            let mut channel = handler.channel();
            channel.write_all(b"ping").expect("write failed");
        }

        let echoed = data_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("registration never became live");
        assert_eq!(echoed, b"ping".to_vec());

        server.shutdown().expect("server shutdown failed");
        pool.shutdown();
    }

    #[test]
    fn connect_after_shutdown_is_refused() {
        let pool: Arc<dyn TaskPool> = Arc::new(FixedPool::new(1, 16));
        let (mut client, _probe, _data_rx) = client_reactor(
            b"unused",
            false,
            pool.clone(),
            Arc::new(RecordingSink::default()),
        );
        let target = client.local_addr();
        client.shutdown().expect("shutdown failed");
        assert!(matches!(client.connect_to(target), Err(Error::Shutdown)));
        pool.shutdown();
    }
}
