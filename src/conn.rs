//! The per-connection state block. The server owns one per peer, the client
//! owns exactly one; both drive it the same way: inbound messages and epoch
//! ticks mutate it under the endpoint lock, application threads pull ordered
//! deliveries out of it.

use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};

use log::{debug, trace};

use crate::msg::Message;
use crate::params::Params;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Estab,
    Closing,
    Closed,
    Dropped,
}

/// Retransmission schedule for one in-flight message. The first send happens
/// at submission; after that, each retransmit waits out `cur` full epochs,
/// and `cur` doubles with every retransmit up to the cap. A cap of zero
/// retransmits every epoch.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    cur: u32,
    passed: u32,
}

impl Backoff {
    fn new() -> Backoff {
        Backoff { cur: 0, passed: 0 }
    }

    /// One epoch elapsed; true means retransmit now.
    fn tick(&mut self, cap: u32) -> bool {
        if self.passed >= self.cur {
            self.passed = 0;
            self.cur = if self.cur == 0 {
                cap.min(1)
            } else {
                (self.cur * 2).min(cap)
            };
            true
        } else {
            self.passed += 1;
            false
        }
    }
}

/// A window element: one unacknowledged outbound message and its schedule.
/// Lives in its window slot (or the write buffer) until the matching ack
/// empties the slot, which is also what stops the retransmission.
#[derive(Debug, Clone)]
struct Unacked {
    seq_num: i32,
    frame: Vec<u8>,
    backoff: Backoff,
}

impl Unacked {
    fn new(seq_num: i32, frame: Vec<u8>) -> Unacked {
        Unacked {
            seq_num,
            frame,
            backoff: Backoff::new(),
        }
    }
}

#[derive(Debug)]
pub struct Conn {
    conn_id: i32,
    peer: SocketAddr,
    state: State,
    params: Params,

    // receive side: in-order reassembly
    seq_expected: i32,
    pending: Vec<Message>,
    push: Option<Vec<u8>>,
    drop_pending: bool,

    // send side: sliding window
    write_seq_num: i32,
    window: Vec<Option<Unacked>>,
    window_start: i32,
    write_buffer: VecDeque<Unacked>,

    // client handshake; seq 0 predates the window, so it lives outside it
    connect_elem: Option<Unacked>,

    // liveness
    epochs_idle: u32,
    sent_this_epoch: bool,
}

impl Conn {
    fn new(conn_id: i32, peer: SocketAddr, params: Params, state: State) -> Conn {
        Conn {
            conn_id,
            peer,
            state,
            seq_expected: 1,
            pending: Vec::new(),
            push: None,
            drop_pending: false,
            write_seq_num: 1,
            window: vec![None; params.window_size],
            window_start: 1,
            write_buffer: VecDeque::new(),
            connect_elem: None,
            epochs_idle: 0,
            sent_this_epoch: false,
            params,
        }
    }

    /// Client side: transmits the Connect immediately and keeps resending it
    /// on the backoff schedule until the server's ack arrives or the idle
    /// deadline gives up.
    pub fn connect(peer: SocketAddr, params: Params, socket: &UdpSocket) -> Conn {
        let mut conn = Conn::new(0, peer, params, State::Connecting);
        let frame = Message::connect().encode();
        send_frame(socket, peer, &frame);
        conn.sent_this_epoch = true;
        conn.connect_elem = Some(Unacked::new(0, frame));
        conn
    }

    /// Server side: sub-connections are born established by the dispatcher.
    pub fn establish(conn_id: i32, peer: SocketAddr, params: Params) -> Conn {
        Conn::new(conn_id, peer, params, State::Estab)
    }

    pub fn conn_id(&self) -> i32 {
        self.conn_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn has_push(&self) -> bool {
        self.push.is_some()
    }

    pub fn has_drop_notice(&self) -> bool {
        self.drop_pending
    }

    /// Any verified inbound message counts as peer activity.
    pub fn note_activity(&mut self) {
        self.epochs_idle = 0;
    }

    /// Ack for the Connect: captures the id the server assigned. Outside the
    /// handshake it is just a heartbeat.
    pub fn on_connect_ack(&mut self, conn_id: i32) {
        if self.state == State::Connecting {
            self.conn_id = conn_id;
            self.connect_elem = None;
            self.state = State::Estab;
            debug!("connection {conn_id} established");
        }
    }

    /// Answer a Connect, first or duplicate: the same ack either way.
    pub fn ack_connect(&mut self, socket: &UdpSocket) {
        send_frame(socket, self.peer, &Message::ack(self.conn_id, 0).encode());
        self.sent_this_epoch = true;
    }

    /// Submit one application write. Window if it fits, buffer otherwise.
    pub fn write(&mut self, payload: &[u8], socket: &UdpSocket) -> Result<(), Error> {
        match self.state {
            State::Estab => {}
            State::Closing | State::Closed => return Err(Error::AlreadyClosing),
            State::Connecting | State::Dropped => {
                return Err(Error::Disconnected(self.conn_id))
            }
        }

        let seq_num = self.write_seq_num;
        self.write_seq_num += 1;
        let frame = Message::data(self.conn_id, seq_num, payload.to_vec()).encode();
        let elem = Unacked::new(seq_num, frame);

        let index = (seq_num - self.window_start) as usize;
        if index < self.window.len() && self.window[index].is_none() {
            send_frame(socket, self.peer, &elem.frame);
            self.sent_this_epoch = true;
            self.window[index] = Some(elem);
        } else {
            self.write_buffer.push_back(elem);
        }
        Ok(())
    }

    /// Ack for data message `seq_num`: empty its slot and, when the left
    /// edge moved, slide the window and induct buffered writes into the
    /// freed tail. Duplicate or out-of-range acks change nothing.
    pub fn on_ack(&mut self, seq_num: i32, socket: &UdpSocket) {
        if seq_num < self.window_start {
            return;
        }
        let index = (seq_num - self.window_start) as usize;
        if index >= self.window.len() || self.window[index].take().is_none() {
            return;
        }
        trace!("conn {}: seq {seq_num} acked", self.conn_id);
        if index > 0 {
            return;
        }

        let mut offset = self.window.iter().take_while(|slot| slot.is_none()).count();
        offset = offset.min((self.write_seq_num - self.window_start) as usize);
        self.window.drain(..offset);
        self.window.resize_with(self.params.window_size, || None);
        self.window_start += offset as i32;

        // buffered seqnums are contiguous past the old right edge, so they
        // land exactly in the freed tail slots
        let refill = offset.min(self.write_buffer.len());
        for _ in 0..refill {
            let elem = self.write_buffer.pop_front().unwrap();
            let index = (elem.seq_num - self.window_start) as usize;
            send_frame(socket, self.peer, &elem.frame);
            self.sent_this_epoch = true;
            self.window[index] = Some(elem);
        }
    }

    /// Inbound data message. Always re-acked (duplicates included), then
    /// slotted for in-order delivery. Ignored entirely once closing.
    pub fn on_data(&mut self, msg: Message, socket: &UdpSocket) {
        if self.state != State::Estab {
            return;
        }

        let ack = Message::ack(self.conn_id, msg.seq_num).encode();
        send_frame(socket, self.peer, &ack);
        self.sent_this_epoch = true;

        if msg.seq_num < self.seq_expected {
            return; // already delivered
        }
        if msg.seq_num == self.seq_expected {
            if self.push.is_none() {
                self.push = Some(msg.payload);
            }
            // a duplicate of the undelivered push carries the same bytes
        } else if !self.pending.iter().any(|m| m.seq_num == msg.seq_num) {
            self.pending.push(msg);
        }
    }

    /// Hand the single ordered message to the application. Advances
    /// `seq_expected` and promotes at most one successor; further contiguous
    /// messages wait for the next read.
    pub fn take_push(&mut self) -> Option<(i32, Vec<u8>)> {
        let payload = self.push.take()?;
        self.seq_expected += 1;
        if let Some(pos) = self
            .pending
            .iter()
            .position(|m| m.seq_num == self.seq_expected)
        {
            let next = self.pending.swap_remove(pos);
            self.push = Some(next.payload);
        }
        Some((self.conn_id, payload))
    }

    /// The one drop notification, reported only after any already-promoted
    /// delivery has been consumed.
    pub fn take_drop_notice(&mut self) -> bool {
        if self.drop_pending && self.push.is_none() {
            self.drop_pending = false;
            true
        } else {
            false
        }
    }

    /// One epoch tick: idle deadline, retransmission schedule, heartbeat.
    /// Returns true when the idle deadline fired.
    pub fn on_tick(&mut self, socket: &UdpSocket) -> bool {
        if matches!(self.state, State::Closed | State::Dropped) {
            return false;
        }

        self.epochs_idle += 1;
        if self.epochs_idle >= self.params.epoch_limit {
            debug!(
                "conn {}: peer silent for {} epochs, dropping",
                self.conn_id, self.epochs_idle
            );
            self.declare_dropped();
            return true;
        }

        let cap = self.params.max_backoff_interval;
        let peer = self.peer;
        let mut sent = self.sent_this_epoch;

        if let Some(elem) = self.connect_elem.as_mut() {
            if elem.backoff.tick(cap) {
                trace!("resending connect request");
                send_frame(socket, peer, &elem.frame);
                sent = true;
            }
        }
        for elem in self.window.iter_mut().flatten() {
            if elem.backoff.tick(cap) {
                trace!("conn {}: resending seq {}", self.conn_id, elem.seq_num);
                send_frame(socket, peer, &elem.frame);
                sent = true;
            }
        }

        // a quiet epoch still tells the peer we are alive
        if !sent && self.state != State::Connecting {
            send_frame(socket, peer, &Message::ack(self.conn_id, 0).encode());
        }
        self.sent_this_epoch = false;
        false
    }

    /// Graceful close request: no new writes, inbound data ignored, the
    /// outbound side keeps draining.
    pub fn close(&mut self) {
        if matches!(self.state, State::Connecting | State::Estab) {
            debug!("conn {}: closing", self.conn_id);
            self.state = State::Closing;
        }
    }

    /// Closing becomes Closed once every outstanding outbound message has
    /// been acknowledged.
    pub fn try_finish_close(&mut self) -> bool {
        if self.state == State::Closing && self.drained() {
            self.state = State::Closed;
            self.push = None;
            self.pending.clear();
        }
        self.state == State::Closed
    }

    pub fn drained(&self) -> bool {
        self.window.iter().all(Option::is_none) && self.write_buffer.is_empty()
    }

    fn declare_dropped(&mut self) {
        // cancels every retransmission at once
        self.window.iter_mut().for_each(|slot| *slot = None);
        self.write_buffer.clear();
        self.connect_elem = None;
        // a connection the application already gave up on drops silently;
        // a failed handshake is surfaced by the endpoint, not the read path
        self.drop_pending = self.state == State::Estab;
        self.state = State::Dropped;
    }
}

/// Datagram sends never block and never fail the protocol: errors are logged
/// and the retransmission schedule covers the loss.
fn send_frame(socket: &UdpSocket, peer: SocketAddr, frame: &[u8]) {
    if let Err(err) = socket.send_to(frame, peer) {
        debug!("send to {peer} failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{decode, Kind};
    use std::time::Duration;

    fn params(window_size: usize) -> Params {
        Params {
            epoch_millis: 10,
            epoch_limit: 100,
            window_size,
            max_backoff_interval: 2,
        }
    }

    /// An established connection wired to a captive peer socket.
    fn conn_with_peer(window_size: usize) -> (Conn, UdpSocket, UdpSocket) {
        let local = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let conn = Conn::establish(1, peer.local_addr().unwrap(), params(window_size));
        (conn, local, peer)
    }

    fn recv(peer: &UdpSocket) -> Option<Message> {
        let mut buf = [0u8; 2048];
        match peer.recv_from(&mut buf) {
            Ok((n, _)) => decode(&buf[..n]),
            Err(_) => None,
        }
    }

    fn recv_data_seqs(peer: &UdpSocket, count: usize) -> Vec<i32> {
        (0..count)
            .map(|_| {
                let msg = recv(peer).expect("expected a datagram");
                assert_eq!(msg.kind, Kind::Data);
                msg.seq_num
            })
            .collect()
    }

    #[test]
    fn window_pressure_buffers_and_inducts() {
        let (mut conn, local, peer) = conn_with_peer(3);

        for i in 0..5u8 {
            conn.write(&[i], &local).unwrap();
        }
        // 1..=3 go on the wire immediately, 4 and 5 wait in the buffer
        assert_eq!(recv_data_seqs(&peer, 3), vec![1, 2, 3]);
        assert!(recv(&peer).is_none());

        // ack for the left edge slides by one and inducts seq 4
        conn.on_ack(1, &local);
        assert_eq!(recv_data_seqs(&peer, 1), vec![4]);

        // ack for 3 leaves the gap at 2 in place: no slide, no induction
        conn.on_ack(3, &local);
        assert!(recv(&peer).is_none());

        // ack for 2 closes the gap: slide by two, induct seq 5
        conn.on_ack(2, &local);
        assert_eq!(recv_data_seqs(&peer, 1), vec![5]);

        conn.on_ack(4, &local);
        conn.on_ack(5, &local);
        assert!(conn.drained());
    }

    #[test]
    fn duplicate_and_stale_acks_are_ignored() {
        let (mut conn, local, peer) = conn_with_peer(2);
        conn.write(b"a", &local).unwrap();
        conn.write(b"b", &local).unwrap();
        assert_eq!(recv_data_seqs(&peer, 2), vec![1, 2]);

        conn.on_ack(1, &local);
        conn.on_ack(1, &local); // duplicate: slot already empty
        conn.on_ack(0, &local); // below the window
        conn.on_ack(9, &local); // beyond the window
        assert!(recv(&peer).is_none());

        conn.on_ack(2, &local);
        assert!(conn.drained());
    }

    #[test]
    fn backoff_schedule_on_the_wire() {
        let (mut conn, local, peer) = conn_with_peer(1);
        conn.write(b"x", &local).unwrap();
        assert_eq!(recv_data_seqs(&peer, 1), vec![1]);

        // with the cap at 2 the retransmits land on ticks 1, 3, 6, 9, ...;
        // every other tick carries the heartbeat instead
        let resend_ticks = [1, 3, 6, 9];
        for tick in 1..=9 {
            conn.on_tick(&local);
            let msg = recv(&peer).expect("one datagram per tick");
            if resend_ticks.contains(&tick) {
                assert_eq!((msg.kind, msg.seq_num), (Kind::Data, 1), "tick {tick}");
            } else {
                assert_eq!((msg.kind, msg.seq_num), (Kind::Ack, 0), "tick {tick}");
            }
        }
    }

    #[test]
    fn heartbeat_suppressed_by_other_traffic() {
        let (mut conn, local, peer) = conn_with_peer(1);

        conn.on_tick(&local);
        let msg = recv(&peer).unwrap();
        assert_eq!((msg.kind, msg.seq_num), (Kind::Ack, 0));

        // a write in this epoch replaces the heartbeat; the tick still
        // carries the first scheduled retransmit
        conn.write(b"x", &local).unwrap();
        conn.on_tick(&local);
        assert_eq!(recv_data_seqs(&peer, 2), vec![1, 1]);
        assert!(recv(&peer).is_none());
    }

    #[test]
    fn reordered_data_is_delivered_in_order() {
        let (mut conn, local, peer) = conn_with_peer(1);

        conn.on_data(Message::data(1, 2, b"second".to_vec()), &local);
        conn.on_data(Message::data(1, 1, b"first".to_vec()), &local);

        // one ack per received message, in arrival order
        let acks: Vec<i32> = (0..2).map(|_| recv(&peer).unwrap().seq_num).collect();
        assert_eq!(acks, vec![2, 1]);

        assert_eq!(conn.take_push(), Some((1, b"first".to_vec())));
        assert_eq!(conn.take_push(), Some((1, b"second".to_vec())));
        assert_eq!(conn.take_push(), None);
    }

    #[test]
    fn duplicate_data_is_acked_but_not_requeued() {
        let (mut conn, local, peer) = conn_with_peer(1);

        conn.on_data(Message::data(1, 3, b"late".to_vec()), &local);
        conn.on_data(Message::data(1, 3, b"late".to_vec()), &local);
        assert_eq!(conn.pending.len(), 1);

        conn.on_data(Message::data(1, 1, b"a".to_vec()), &local);
        conn.on_data(Message::data(1, 1, b"a".to_vec()), &local);
        assert_eq!(conn.take_push(), Some((1, b"a".to_vec())));
        assert_eq!(conn.take_push(), None); // seq 2 still missing

        // four data messages, four acks
        let acks: Vec<i32> = (0..4).map(|_| recv(&peer).unwrap().seq_num).collect();
        assert_eq!(acks, vec![3, 3, 1, 1]);

        // stale retransmit of an already-delivered seq: ack only
        conn.on_data(Message::data(1, 1, b"a".to_vec()), &local);
        assert!(conn.pending.iter().all(|m| m.seq_num > conn.seq_expected));
        assert!(!conn.has_push());
    }

    #[test]
    fn idle_deadline_drops_the_connection() {
        let (mut conn, local, peer) = conn_with_peer(1);
        conn.params.epoch_limit = 3;
        conn.write(b"x", &local).unwrap();
        assert_eq!(recv_data_seqs(&peer, 1), vec![1]);

        assert!(!conn.on_tick(&local));
        conn.note_activity(); // inbound traffic pushes the deadline out
        assert!(!conn.on_tick(&local));
        assert!(!conn.on_tick(&local));
        assert!(conn.on_tick(&local));

        assert_eq!(conn.state(), State::Dropped);
        assert!(conn.drained()); // retransmission state cleared
        assert!(conn.take_drop_notice());
        assert!(!conn.take_drop_notice()); // reported exactly once
        assert!(matches!(
            conn.write(b"y", &local),
            Err(Error::Disconnected(1))
        ));
    }

    #[test]
    fn drop_notice_waits_for_buffered_delivery() {
        let (mut conn, local, _peer) = conn_with_peer(1);
        conn.params.epoch_limit = 1;

        conn.on_data(Message::data(1, 1, b"buffered".to_vec()), &local);
        assert!(conn.on_tick(&local));

        assert!(!conn.take_drop_notice());
        assert_eq!(conn.take_push(), Some((1, b"buffered".to_vec())));
        assert!(conn.take_drop_notice());
    }

    #[test]
    fn close_rejects_writes_and_drains() {
        let (mut conn, local, peer) = conn_with_peer(1);
        conn.write(b"x", &local).unwrap();
        conn.close();

        assert!(matches!(
            conn.write(b"y", &local),
            Err(Error::AlreadyClosing)
        ));
        // inbound data is ignored outright once closing: no ack, no delivery
        conn.on_data(Message::data(1, 1, b"ignored".to_vec()), &local);
        assert!(!conn.has_push());

        assert!(!conn.try_finish_close());
        conn.on_ack(1, &local);
        assert!(conn.try_finish_close());
        assert_eq!(conn.state(), State::Closed);

        assert_eq!(recv_data_seqs(&peer, 1), vec![1]);
        assert!(recv(&peer).is_none());
    }

    #[test]
    fn connect_handshake_resolves_or_times_out() {
        let local = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();

        let mut conn = Conn::connect(peer.local_addr().unwrap(), params(1), &local);
        let msg = recv(&peer).unwrap();
        assert_eq!(msg.kind, Kind::Connect);
        assert_eq!(conn.state(), State::Connecting);

        // tick 1 resends the connect request (no heartbeats yet: the
        // connection id is not known before the handshake completes)
        conn.on_tick(&local);
        assert_eq!(recv(&peer).unwrap().kind, Kind::Connect);

        conn.on_connect_ack(7);
        assert_eq!(conn.state(), State::Estab);
        assert_eq!(conn.conn_id(), 7);

        // an unanswered handshake drops without a read-path notice
        let mut dark = Conn::connect(peer.local_addr().unwrap(), params(1), &local);
        dark.params.epoch_limit = 2;
        assert!(!dark.on_tick(&local));
        assert!(dark.on_tick(&local));
        assert_eq!(dark.state(), State::Dropped);
        assert!(!dark.has_drop_notice());
    }
}
