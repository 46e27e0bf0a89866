//! Shared event loop for stream transports.
//!
//! TCP and SCTP (one-to-one style) sockets behave identically once
//! connected, so both drivers are one `StreamDriver` distinguished by
//! the socket protocol. The driver runs a single I/O thread:
//!
//! 1. drain the command queue (connects and closes posted by node threads)
//! 2. compute the poll timeout from the node's timer state
//! 3. poll listener + sockets + wakeup pipe
//! 4. accept, finish connects, read and frame, flush outbound buffers
//! 5. run the node's timer walk
//!
//! Node threads never touch a socket; they post commands and write to
//! the shared per-connection outbound buffers, then call `wakeup`.

use crate::message::Message;
use crate::node::{Connection, ConnectionKey, ConnectionTimers, Node, SendHandle};
use crate::peer::Peer;
use crate::transport::pollset::{self, Waker, POLL_ERR, POLL_IN, POLL_OUT};
use crate::transport::{net, TransportDriver, TransportError, TransportKind};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::ops::RangeInclusive;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Read chunk size for the event loop.
const READ_CHUNK: usize = 64 * 1024;

/// Commands posted to the I/O thread by node threads.
enum Command {
    /// Adopt a socket (outbound connect in flight).
    Register {
        key: ConnectionKey,
        stream: TcpStream,
        send: SendHandle,
    },
    /// Close a socket: flush-or-abort.
    Close { key: ConnectionKey, reset: bool },
}

/// Per-socket state owned by the I/O thread.
struct Sock {
    stream: TcpStream,
    send: SendHandle,
    inbuf: Vec<u8>,
    connecting: bool,
}

/// A stream-transport driver.
pub struct StreamDriver {
    kind: TransportKind,
    protocol: libc::c_int,
    listen_port: u16,
    port_range: Option<RangeInclusive<u16>>,
    waker: Mutex<Option<Arc<Waker>>>,
    listener: Mutex<Option<TcpListener>>,
    cmds: Mutex<Vec<Command>>,
    stop_deadline: Mutex<Option<Instant>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StreamDriver {
    pub(crate) fn new(
        kind: TransportKind,
        protocol: libc::c_int,
        listen_port: u16,
        port_range: Option<RangeInclusive<u16>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            protocol,
            listen_port,
            port_range,
            waker: Mutex::new(None),
            listener: Mutex::new(None),
            cmds: Mutex::new(Vec::new()),
            stop_deadline: Mutex::new(None),
            thread: Mutex::new(None),
        })
    }

    fn push_cmd(&self, cmd: Command) {
        self.cmds.lock().unwrap_or_else(|e| e.into_inner()).push(cmd);
        self.wakeup();
    }
}

impl TransportDriver for StreamDriver {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn open_io(&self) -> Result<(), TransportError> {
        let waker = Waker::new().map_err(TransportError::Io)?;
        *self.waker.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(waker));

        if self.listen_port != 0 {
            let listener = net::listen(self.protocol, self.listen_port).map_err(|source| TransportError::Bind {
                kind: self.kind,
                port: self.listen_port,
                source,
            })?;
            info!(kind = %self.kind, port = self.listen_port, "Listening for peer connections");
            *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
        }
        Ok(())
    }

    fn close_io(&self) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.waker.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn start(self: Arc<Self>, core: Node) -> Result<(), TransportError> {
        let mut slot = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let driver = self.clone();
        let name = format!("diapeer-{}-io", self.kind);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(driver, core))
            .map_err(TransportError::Io)?;
        *slot = Some(handle);
        Ok(())
    }

    fn initiate_stop(&self, deadline: Instant) {
        *self.stop_deadline.lock().unwrap_or_else(|e| e.into_inner()) = Some(deadline);
    }

    fn wakeup(&self) {
        if let Some(waker) = self.waker.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            waker.wake();
        }
    }

    fn join(&self) {
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn new_connection(self: Arc<Self>, timers: ConnectionTimers) -> Connection {
        Connection::new(self, crate::node::ConnState::Connecting, timers)
    }

    fn initiate_connection(&self, conn: &mut Connection, peer: &Peer) -> bool {
        let addr = match (peer.host(), peer.port()).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    warn!(%peer, "Peer resolved to no addresses");
                    return false;
                }
            },
            Err(e) => {
                warn!(%peer, error = %e, "Peer address resolution failed");
                return false;
            }
        };

        let port_range = if self.kind == TransportKind::Tcp {
            self.port_range.as_ref()
        } else {
            None
        };
        let stream = match net::connect_nonblocking(self.protocol, addr, port_range) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%peer, %addr, error = %e, "Connect could not be initiated");
                return false;
            }
        };

        conn.set_remote_addr(addr);
        if let Ok(local) = stream.local_addr() {
            conn.set_local_addr(local);
        }
        debug!(%peer, %addr, key = %conn.key(), "Connect in flight");
        self.push_cmd(Command::Register {
            key: conn.key(),
            stream,
            send: conn.send_handle(),
        });
        true
    }

    fn close(&self, conn: &Connection, reset: bool) {
        conn.send_handle().close();
        self.push_cmd(Command::Close { key: conn.key(), reset });
    }
}

/// Why the read side wants the socket gone.
enum ReadVerdict {
    KeepGoing,
    /// Orderly close (EOF, engine said no, write path dead).
    CloseHard,
    /// Garbage on the wire: abort with RST.
    CloseReset,
}

fn run_loop(driver: Arc<StreamDriver>, core: Node) {
    let dyn_self: Arc<dyn TransportDriver> = driver.clone();
    let waker = match driver.waker.lock().unwrap_or_else(|e| e.into_inner()).clone() {
        Some(waker) => waker,
        None => {
            warn!(kind = %driver.kind, "Driver started without open_io; event loop not running");
            return;
        }
    };
    let mut listener = driver.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
    let mut socks: HashMap<ConnectionKey, Sock> = HashMap::new();
    debug!(kind = %driver.kind, "Transport event loop running");

    loop {
        // Commands from node threads.
        let cmds = std::mem::take(&mut *driver.cmds.lock().unwrap_or_else(|e| e.into_inner()));
        for cmd in cmds {
            match cmd {
                Command::Register { key, stream, send } => {
                    socks.insert(
                        key,
                        Sock {
                            stream,
                            send,
                            inbuf: Vec::new(),
                            connecting: true,
                        },
                    );
                }
                Command::Close { key, reset } => {
                    if let Some(sock) = socks.remove(&key) {
                        finish_close(sock, reset);
                    }
                }
            }
        }

        // Shutdown: stop accepting immediately, drain until the
        // deadline or until every socket is gone.
        let stop_deadline = *driver.stop_deadline.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(deadline) = stop_deadline {
            listener = None;
            if socks.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                info!(kind = %driver.kind, remaining = socks.len(), "Shutdown deadline reached; dropping sockets");
                break;
            }
        }

        let timeout = core
            .calc_next_timeout(driver.kind)
            .map(|t| t.saturating_duration_since(Instant::now()));

        // Poll set: wakeup pipe first, listener second, sockets after.
        let mut fds = Vec::with_capacity(2 + socks.len());
        let mut keys = Vec::with_capacity(socks.len());
        fds.push(pollset::poll_fd(waker.read_fd(), POLL_IN));
        if let Some(l) = &listener {
            fds.push(pollset::poll_fd(l.as_raw_fd(), POLL_IN));
        }
        let sock_base = fds.len();
        for (key, sock) in &socks {
            let mut events = POLL_IN;
            if sock.connecting || sock.send.pending() > 0 {
                events |= POLL_OUT;
            }
            fds.push(pollset::poll_fd(sock.stream.as_raw_fd(), events));
            keys.push(*key);
        }

        match pollset::poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(e) => {
                warn!(kind = %driver.kind, error = %e, "poll failed; stopping event loop");
                break;
            }
        }

        if fds[0].revents != 0 {
            waker.drain();
        }

        if let Some(l) = &listener {
            if fds[1].revents & POLL_IN != 0 {
                accept_ready(l, &core, &dyn_self, &mut socks);
            }
        }

        let mut dead: Vec<(ConnectionKey, bool)> = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            let revents = fds[sock_base + i].revents;
            if revents == 0 {
                continue;
            }
            let sock = match socks.get_mut(key) {
                Some(sock) => sock,
                None => continue,
            };

            if sock.connecting {
                if revents & (POLL_OUT | POLL_ERR) != 0 {
                    let outcome = match sock.stream.take_error() {
                        Ok(None) if revents & POLL_ERR == 0 => Ok(()),
                        Ok(Some(e)) => Err(e),
                        Ok(None) => Err(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)),
                        Err(e) => Err(e),
                    };
                    match outcome {
                        Ok(()) => {
                            sock.connecting = false;
                            let local = sock.stream.local_addr().ok();
                            core.connection_established(key, local);
                        }
                        Err(e) => {
                            core.connect_failed(key, &e);
                            dead.push((*key, false));
                        }
                    }
                }
                continue;
            }

            if revents & (POLL_IN | POLL_ERR) != 0 {
                match read_ready(sock, &core, key) {
                    ReadVerdict::KeepGoing => {}
                    ReadVerdict::CloseHard => {
                        dead.push((*key, false));
                        continue;
                    }
                    ReadVerdict::CloseReset => {
                        dead.push((*key, true));
                        continue;
                    }
                }
            }

            if revents & POLL_OUT != 0 {
                let stream = &mut sock.stream;
                match sock.send.flush_with(|data| stream.write(data)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!(%key, error = %e, "Write failed");
                        core.close_connection(key, false);
                        dead.push((*key, false));
                    }
                }
            }
        }

        for (key, reset) in dead {
            if let Some(sock) = socks.remove(&key) {
                finish_close(sock, reset);
            }
        }

        core.run_timers(driver.kind);
    }

    debug!(kind = %driver.kind, "Transport event loop stopped");
}

fn accept_ready(
    listener: &TcpListener,
    core: &Node,
    dyn_self: &Arc<dyn TransportDriver>,
    socks: &mut HashMap<ConnectionKey, Sock>,
) {
    loop {
        match listener.accept() {
            Ok((stream, remote)) => {
                if stream.set_nonblocking(true).is_err() {
                    continue;
                }
                let local = stream.local_addr().ok();
                match core.accept_connection(dyn_self.clone(), remote, local) {
                    Some((key, send)) => {
                        debug!(%remote, %key, "Accepted inbound connection");
                        socks.insert(
                            key,
                            Sock {
                                stream,
                                send,
                                inbuf: Vec::new(),
                                connecting: false,
                            },
                        );
                    }
                    // The node is shutting down.
                    None => drop(stream),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Drain readable bytes and hand complete frames to the engine.
fn read_ready(sock: &mut Sock, core: &Node, key: &ConnectionKey) -> ReadVerdict {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match sock.stream.read(&mut chunk) {
            Ok(0) => {
                debug!(%key, "Peer closed the connection");
                core.close_connection(key, false);
                return ReadVerdict::CloseHard;
            }
            Ok(n) => {
                sock.inbuf.extend_from_slice(&chunk[..n]);
                match process_frames(sock, core, key) {
                    ReadVerdict::KeepGoing => {}
                    verdict => return verdict,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return ReadVerdict::KeepGoing,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(%key, error = %e, "Read failed");
                core.close_connection(key, false);
                return ReadVerdict::CloseHard;
            }
        }
    }
}

fn process_frames(sock: &mut Sock, core: &Node, key: &ConnectionKey) -> ReadVerdict {
    loop {
        let frame_len = match Message::peek_length(&sock.inbuf) {
            Ok(None) => return ReadVerdict::KeepGoing,
            Ok(Some(len)) => len,
            Err(e) => {
                warn!(%key, error = %e, "{}", hex_dump("Garbage on connection", &sock.inbuf));
                core.close_connection(key, true);
                return ReadVerdict::CloseReset;
            }
        };
        if sock.inbuf.len() < frame_len {
            return ReadVerdict::KeepGoing;
        }
        let raw: Vec<u8> = sock.inbuf.drain(..frame_len).collect();
        let msg = match Message::decode(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%key, error = %e, "{}", hex_dump("Undecodable frame", &raw));
                core.close_connection(key, true);
                return ReadVerdict::CloseReset;
            }
        };
        trace!(%key, "{}", hex_dump("Raw frame decoded", &raw));
        if !core.handle_message(msg, key) {
            core.close_connection(key, false);
            return ReadVerdict::CloseHard;
        }
    }
}

fn finish_close(sock: Sock, reset: bool) {
    if reset {
        net::set_linger_zero(&sock.stream);
        return;
    }
    // Best-effort final flush of whatever the engine queued (DPA, error
    // answers) before the socket drops.
    let mut stream = sock.stream;
    let _ = sock.send.flush_with(|data| stream.write(data));
}

/// Render bytes the way protocol people expect to read them. Capped at
/// 1 KiB; anything longer is noise.
pub(crate) fn hex_dump(title: &str, data: &[u8]) -> String {
    let shown = &data[..data.len().min(1024)];
    let mut out = String::with_capacity(title.len() + shown.len() * 4 + 32);
    out.push_str(title);
    out.push('\n');
    for line in shown.chunks(16) {
        for (i, byte) in line.iter().enumerate() {
            if i % 4 == 0 {
                out.push(' ');
            }
            out.push_str(&format!("{byte:02X}"));
        }
        for i in line.len()..16 {
            if i % 4 == 0 {
                out.push(' ');
            }
            out.push_str("  ");
        }
        out.push_str("  ");
        for byte in line {
            out.push(if (32..127).contains(byte) { *byte as char } else { '.' });
        }
        out.push('\n');
    }
    if data.len() > 1024 {
        out.push_str("(truncated)\n");
    }
    out
}
