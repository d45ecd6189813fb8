//! The server endpoint: one socket, many sub-connections. Inbound datagrams
//! are routed by source address; each sub-connection is a client-shaped state
//! block with its own window, reassembly buffer and timers.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};
use nix::poll::{poll, PollFd, PollFlags};

use crate::conn::{Conn, State};
use crate::msg::{decode, Kind, Message, MAX_DATAGRAM};
use crate::params::Params;
use crate::{millis_until, Error};

#[derive(Debug)]
struct Inner {
    /// Owning table, keyed by connection id.
    conns: HashMap<i32, Conn>,
    /// Routing index for inbound datagrams. Kept consistent with `conns` by
    /// updating both on every insert and remove.
    by_addr: HashMap<SocketAddr, i32>,
    next_conn_id: i32,
    about_to_close: bool,
    terminate: bool,
}

impl Inner {
    fn dispatch(&mut self, msg: Message, from: SocketAddr, socket: &UdpSocket, params: &Params) {
        match msg.kind {
            Kind::Connect => {
                let conn_id = match self.by_addr.get(&from) {
                    Some(&id) => id, // duplicate connect: same ack, no state reset
                    None if self.about_to_close => return,
                    None => {
                        let id = self.next_conn_id;
                        self.next_conn_id += 1;
                        self.by_addr.insert(from, id);
                        self.conns
                            .insert(id, Conn::establish(id, from, params.clone()));
                        debug!("connection {id} established for {from}");
                        id
                    }
                };
                let conn = self.conns.get_mut(&conn_id).unwrap();
                conn.note_activity();
                conn.ack_connect(socket);
            }
            Kind::Data | Kind::Ack => {
                let Some(&conn_id) = self.by_addr.get(&from) else {
                    trace!("dropping {msg} from unknown peer {from}");
                    return;
                };
                let conn = self.conns.get_mut(&conn_id).unwrap();
                conn.note_activity();
                match msg.kind {
                    Kind::Data => conn.on_data(msg, socket),
                    Kind::Ack if msg.seq_num != 0 => conn.on_ack(msg.seq_num, socket),
                    _ => {} // heartbeat; activity already noted
                }
            }
        }
    }

    /// Next deliverable event: ordered messages first, then drop notices.
    /// A dropped connection leaves the table once its notice is consumed.
    fn take_delivery(&mut self) -> Option<Result<(i32, Vec<u8>), Error>> {
        for conn in self.conns.values_mut() {
            if let Some(delivery) = conn.take_push() {
                return Some(Ok(delivery));
            }
        }
        let dropped = self
            .conns
            .values_mut()
            .find_map(|conn| conn.take_drop_notice().then(|| conn.conn_id()));
        if let Some(conn_id) = dropped {
            self.remove(conn_id);
            return Some(Err(Error::Disconnected(conn_id)));
        }
        None
    }

    fn remove(&mut self, conn_id: i32) {
        if let Some(conn) = self.conns.remove(&conn_id) {
            self.by_addr.remove(&conn.peer());
            debug!("connection {conn_id} torn down");
        }
    }

    /// Retire finished sub-connections and wake whoever waits on the result.
    fn sweep(&mut self, shared: &Shared) {
        let closing = self.about_to_close;
        let done: Vec<i32> = self
            .conns
            .values_mut()
            .filter_map(|conn| {
                conn.try_finish_close();
                let gone = match conn.state() {
                    State::Closed => true,
                    // an unread drop notice keeps the entry alive, except
                    // when the whole endpoint is going away
                    State::Dropped => closing || !conn.has_drop_notice(),
                    _ => false,
                };
                gone.then(|| conn.conn_id())
            })
            .collect();
        for conn_id in done {
            self.remove(conn_id);
            shared.cvar.notify_all();
        }

        if self
            .conns
            .values()
            .any(|conn| conn.has_push() || conn.has_drop_notice())
        {
            shared.rvar.notify_all();
        }
        if self.about_to_close && self.conns.is_empty() {
            shared.cvar.notify_all();
            shared.rvar.notify_all();
        }
    }
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    /// Deliveries and drop notices.
    rvar: Condvar,
    /// Teardown progress.
    cvar: Condvar,
}

#[derive(Debug)]
pub struct Server {
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    jh: Option<thread::JoinHandle<()>>,
}

impl Server {
    /// Binds the port and starts the packet loop. Does not block.
    pub fn new(port: u16, params: Params) -> Result<Server, Error> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port))?);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                conns: HashMap::new(),
                by_addr: HashMap::new(),
                next_conn_id: 1,
                about_to_close: false,
                terminate: false,
            }),
            rvar: Condvar::new(),
            cvar: Condvar::new(),
        });

        let jh = {
            let shared = shared.clone();
            let socket = socket.clone();
            thread::spawn(move || packet_loop(socket, shared, params))
        };

        Ok(Server {
            shared,
            socket,
            jh: Some(jh),
        })
    }

    /// The bound address; useful when constructed with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }

    /// Next ordered `(conn_id, payload)` from any client, or the one-shot
    /// drop notice for a connection that timed out. Blocks otherwise.
    pub fn read(&self) -> Result<(i32, Vec<u8>), Error> {
        let mut inner = self.shared.inner.lock().unwrap();
        loop {
            if let Some(delivery) = inner.take_delivery() {
                return delivery;
            }
            if inner.terminate || (inner.about_to_close && inner.conns.is_empty()) {
                return Err(Error::AlreadyClosing);
            }
            inner = self.shared.rvar.wait(inner).unwrap();
        }
    }

    /// Queue one message to the given client. Never blocks.
    pub fn write(&self, conn_id: i32, payload: &[u8]) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.conns.get_mut(&conn_id) {
            Some(conn) => conn.write(payload, &self.socket),
            None => Err(Error::UnknownConnection(conn_id)),
        }
    }

    /// Begin a graceful close of one sub-connection. Its outbound side keeps
    /// draining; it leaves the table once done.
    pub fn close_conn(&self, conn_id: i32) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock().unwrap();
        match inner.conns.get_mut(&conn_id) {
            Some(conn) => {
                conn.close();
                conn.try_finish_close();
                Ok(())
            }
            None => Err(Error::UnknownConnection(conn_id)),
        }
    }

    /// Graceful shutdown: every sub-connection drains (or drops trying),
    /// then the socket is released. Idempotent.
    pub fn close(&mut self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.terminate {
                inner.about_to_close = true;
                for conn in inner.conns.values_mut() {
                    conn.close();
                }
                while !inner.conns.is_empty() {
                    inner = self.shared.cvar.wait(inner).unwrap();
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

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
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

        if ready > 0 {
            if let Ok((n, from)) = socket.recv_from(&mut buf) {
                match decode(&buf[..n]) {
                    Some(mut msg) => {
                        if msg.verify() {
                            trace!("recv {msg} from {from}");
                            inner.dispatch(msg, from, &socket, &params);
                        } else {
                            debug!("dropping corrupt {msg} from {from}");
                        }
                    }
                    None => debug!("dropping undecodable datagram from {from}"),
                }
            }
        }

        if Instant::now() >= next_tick {
            next_tick += epoch;
            for conn in inner.conns.values_mut() {
                conn.on_tick(&socket);
            }
        }

        inner.sweep(&shared);
    }
}
