//! The client endpoint: one connection to one server. A single packet-loop
//! thread owns the socket and the timers; the application blocks on condition
//! variables for deliveries and for the connect/close handshakes.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};
use nix::poll::{poll, PollFd, PollFlags};

use crate::conn::{Conn, State};
use crate::msg::{decode, Kind, MAX_DATAGRAM};
use crate::params::Params;
use crate::{millis_until, Error};

#[derive(Debug)]
struct Inner {
    conn: Conn,
    terminate: bool,
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    /// Deliveries and drop notices.
    rvar: Condvar,
    /// State transitions: establishment, drain completion, drop.
    svar: Condvar,
}

#[derive(Debug)]
pub struct Client {
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    jh: Option<thread::JoinHandle<()>>,
    conn_id: i32,
}

impl Client {
    /// Connects to `hostport` ("host:port"). Blocks until the server
    /// acknowledges the connection request, or until the request has gone
    /// unanswered for the idle deadline.
    pub fn new(hostport: &str, params: Params) -> Result<Client, Error> {
        let peer = hostport.to_socket_addrs()?.next().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "host resolved to no address",
            ))
        })?;
        let socket = Arc::new(UdpSocket::bind(unspecified_for(peer))?);

        let conn = Conn::connect(peer, params.clone(), &socket);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                conn,
                terminate: false,
            }),
            rvar: Condvar::new(),
            svar: Condvar::new(),
        });

        let jh = {
            let shared = shared.clone();
            let socket = socket.clone();
            thread::spawn(move || packet_loop(socket, shared, params))
        };

        let mut client = Client {
            shared,
            socket,
            jh: Some(jh),
            conn_id: 0,
        };

        let mut inner = client.shared.inner.lock().unwrap();
        while inner.conn.state() == State::Connecting {
            inner = client.shared.svar.wait(inner).unwrap();
        }
        if inner.conn.state() != State::Estab {
            drop(inner);
            client.close();
            return Err(Error::ConnectFailed);
        }
        client.conn_id = inner.conn.conn_id();
        drop(inner);

        Ok(client)
    }

    pub fn conn_id(&self) -> i32 {
        self.conn_id
    }

    /// Next ordered message from the server. Blocks until one is available;
    /// returns `Disconnected` once when the connection drops.
    pub fn read(&self) -> Result<Vec<u8>, Error> {
        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            if let Some((_, payload)) = inner.conn.take_push() {
                return Ok(payload);
            }
            if inner.conn.take_drop_notice() {
                return Err(Error::Disconnected(self.conn_id));
            }
            match inner.conn.state() {
                State::Dropped => return Err(Error::Disconnected(self.conn_id)),
                State::Closing | State::Closed => return Err(Error::AlreadyClosing),
                _ if inner.terminate => return Err(Error::AlreadyClosing),
                _ => {}
            }
            inner = self.shared.rvar.wait(inner).unwrap();
        }
    }

    /// Queue one message to the server. Never blocks; fails synchronously
    /// once the connection has dropped or closing has begun.
    pub fn write(&self, payload: &[u8]) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.conn.write(payload, &self.socket)
    }

    /// Graceful close: waits for every outstanding write to be acknowledged
    /// (or for the connection to drop trying), then stops the packet loop.
    /// Idempotent.
    pub fn close(&mut self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.terminate {
                inner.conn.close();
                inner.conn.try_finish_close();
                while !matches!(inner.conn.state(), State::Closed | State::Dropped) {
                    inner = self.shared.svar.wait(inner).unwrap();
                }
                inner.terminate = true;
            }
        }
        self.shared.rvar.notify_all();
        if let Some(jh) = self.jh.take() {
            let _ = jh.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    if peer.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    }
}

fn packet_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>, params: Params) {
    let epoch = Duration::from_millis(params.epoch_millis.max(1));
    let mut next_tick = Instant::now() + epoch;
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let mut pfd = [PollFd::new(socket.as_raw_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut pfd, millis_until(next_tick)).unwrap_or(0);

        let mut inner = shared.inner.lock().unwrap();
        if inner.terminate {
            return;
        }
        let before = inner.conn.state();

        if ready > 0 {
            if let Ok((n, from)) = socket.recv_from(&mut buf) {
                if from == inner.conn.peer() {
                    match decode(&buf[..n]) {
                        Some(mut msg) => {
                            if msg.verify() {
                                trace!("recv {msg}");
                                inner.conn.note_activity();
                                match msg.kind {
                                    // only servers are connected to
                                    Kind::Connect => {}
                                    Kind::Data => inner.conn.on_data(msg, &socket),
                                    Kind::Ack if msg.seq_num == 0 => {
                                        inner.conn.on_connect_ack(msg.conn_id)
                                    }
                                    Kind::Ack => inner.conn.on_ack(msg.seq_num, &socket),
                                }
                            } else {
                                debug!("dropping corrupt {msg} from {from}");
                            }
                        }
                        None => debug!("dropping undecodable datagram from {from}"),
                    }
                }
            }
        }

        if Instant::now() >= next_tick {
            next_tick += epoch;
            inner.conn.on_tick(&socket);
        }
        inner.conn.try_finish_close();

        if inner.conn.has_push() || inner.conn.has_drop_notice() {
            shared.rvar.notify_all();
        }
        if inner.conn.state() != before {
            shared.svar.notify_all();
            shared.rvar.notify_all();
        }
    }
}
