//! The packet link: a reliable, ordered, full-duplex byte service over a
//! raw port.
//!
//! Frames are a six byte header, up to 4095 payload bytes and a CRC-32
//! trailer (see [`packet::Header`] for the exact layout). Flow control is
//! a sliding window over sequence numbers 1..=31: a sender keeps every
//! frame in its slot until the peer's piggybacked acknowledgement passes
//! it, and resends on NAK or on a read timeout. Out-of-order arrivals are
//! parked and delivered once the gap closes; a NAK goes out once per
//! missing sequence.
//!
//! The link hands in-order payloads up through [`Sink::on_data`] and never
//! calls back into itself while the sink runs, so the session above can
//! drive link operations freely between deliveries.

mod packet;
mod ring;

use std::cmp;
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::err::Error;
use crate::port::Port;
use crate::Config;

pub use packet::{Header, PacketType, INTRO, MAX_PAYLOAD};
use packet::{crc_spans, HDR_LEN, MIN_PACKET, PAYLOAD_CRC, TRAILER_LEN};
use ring::Ring;

#[cfg(test)]
mod tests;

/// Consumer of in-order link payloads.
pub trait Sink {
    /// A payload arrived. `head`/`tail` are the bytes as they sit in the
    /// receive ring (`tail` is non-empty only when the payload wraps);
    /// the borrow ends when the call returns. `pos` is the link's current
    /// receive file offset. Both spans empty means end of file.
    fn on_data(&mut self, head: &[u8], tail: &[u8], pos: u64) -> Result<Flow, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep draining.
    Continue,
    /// Hand control back to the session: a command or a file completed.
    Break,
}

/// Which side of the session placed the call. Every frame carries the
/// sender's role so a looped-back line is detected instead of decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Called,
}

/// Counters kept across the life of a link.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    /// Sequenced frames transmitted (first transmissions only).
    pub sent: u64,
    /// Valid frames received, of any type.
    pub received: u64,
    pub resent: u64,
    pub naks: u64,
    pub bad_header: u64,
    pub bad_checksum: u64,
    pub bad_order: u64,
    /// NAKs received from the peer.
    pub remote_rejects: u64,
}

/// What the decoder came back with.
enum Step {
    /// The ring needs at least this many more bytes.
    More(usize),
    /// The sink asked for control.
    Break,
}

/// What a wait is trying to achieve.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Goal {
    Delivered,
    Window,
    Synced,
}

pub struct Link<P> {
    port: P,
    role: Role,
    cfg: Config,
    ring: Ring,
    /// One encoded frame per sequence slot. A slot is rewritten only when
    /// `send_seq` wraps back onto it, which the window guarantees cannot
    /// happen before the peer acknowledged it.
    slots: Vec<Vec<u8>>,
    /// Out-of-order arrivals parked until the gap before them closes.
    parked: [Option<(PacketType, Vec<u8>)>; 32],
    /// Missing sequences we have already asked for.
    naked: [bool; 32],
    send_seq: u8,
    recv_seq: u8,
    local_ack: u8,
    remote_ack: u8,
    send_pos: u64,
    recv_pos: u64,
    remote_packet: usize,
    remote_window: u8,
    synced: bool,
    closing: bool,
    short_reads: u32,
    stats: Stats,
}

impl<P: Port> Link<P> {
    /// Bring the link up: exchange SYNC frames, adopt the peer's packet
    /// size and window, and size the send slots.
    pub fn start(port: P, role: Role, cfg: Config, sink: &mut impl Sink) -> Result<Link<P>, Error> {
        let ring_cap = 2 * (HDR_LEN + cfg.packet_size + TRAILER_LEN) + 64;
        let mut link = Link {
            port,
            role,
            ring: Ring::new(ring_cap),
            slots: Vec::new(),
            parked: std::array::from_fn(|_| None),
            naked: [false; 32],
            send_seq: 1,
            recv_seq: 0,
            local_ack: 0,
            remote_ack: 0,
            send_pos: 0,
            recv_pos: 0,
            remote_packet: cfg.packet_size,
            remote_window: cfg.window,
            synced: false,
            closing: false,
            short_reads: 0,
            stats: Stats::default(),
            cfg,
        };
        link.send_sync()?;
        let (timeout, retries) = (link.cfg.sync_timeout, link.cfg.sync_retries);
        link.wait_for_packet(sink, Goal::Synced, timeout, retries)
            .map_err(|e| match e {
                Error::TimedOut(_) => Error::NoSync,
                e => e,
            })?;
        link.alloc_slots();
        debug!(
            "link up: remote packet {}, remote window {}",
            link.remote_packet, link.remote_window
        );
        Ok(link)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn alloc_slots(&mut self) {
        let mut size = self.remote_packet;
        'size: loop {
            let frame = HDR_LEN + size + TRAILER_LEN;
            let mut slots = Vec::with_capacity(32);
            for _ in 0..32 {
                let mut slot: Vec<u8> = Vec::new();
                if slot.try_reserve_exact(frame).is_err() && size > MIN_PACKET {
                    size = cmp::max(size / 2, MIN_PACKET);
                    continue 'size;
                }
                slot.resize(frame, 0);
                slots.push(slot);
            }
            self.remote_packet = size;
            self.slots = slots;
            return;
        }
    }

    /// The caller's window into the next send slot. File bytes are read
    /// straight into this region; a following [`Link::send_data`] frames
    /// and transmits them without another copy.
    pub fn get_space(&mut self) -> &mut [u8] {
        let n = self.remote_packet;
        &mut self.slots[self.send_seq as usize][HDR_LEN..HDR_LEN + n]
    }

    /// Frame and transmit `len` bytes previously staged through
    /// [`Link::get_space`]. When `pos` is given and disagrees with the
    /// running send offset, an SPOS frame goes out first so the receiver
    /// repositions before applying the data.
    pub fn send_data(
        &mut self,
        len: usize,
        pos: Option<u64>,
        sink: &mut impl Sink,
    ) -> Result<(), Error> {
        if let Some(p) = pos {
            if p != self.send_pos {
                self.stage_spos(p, len, sink)?;
            }
        }
        self.transmit_slot(PacketType::Data, len, sink)?;
        self.send_pos += len as u64;
        Ok(())
    }

    /// Send a command string, fragmented at the peer's packet size. The
    /// final fragment carries the terminating NUL.
    pub fn send_cmd(&mut self, cmd: &str, sink: &mut impl Sink) -> Result<(), Error> {
        debug!("send command {:?}", cmd);
        let bytes = cmd.as_bytes();
        let total = bytes.len() + 1;
        let mut off = 0;
        while off < total {
            let n = cmp::min(self.remote_packet, total - off);
            let space = self.get_space();
            for (i, b) in space[..n].iter_mut().enumerate() {
                *b = if off + i < bytes.len() { bytes[off + i] } else { 0 };
            }
            self.transmit_slot(PacketType::Data, n, sink)?;
            self.send_pos += n as u64;
            off += n;
        }
        Ok(())
    }

    /// Drive the link until the sink breaks: a full command arrived or the
    /// receive file completed.
    pub fn wait(&mut self, sink: &mut impl Sink) -> Result<(), Error> {
        let (timeout, retries) = (self.cfg.timeout, self.cfg.retries);
        self.wait_for_packet(sink, Goal::Delivered, timeout, retries)
    }

    /// Tear the link down. Best effort: the CLOSE is not acknowledged, the
    /// session's hangup exchange has already drained both directions.
    pub fn shutdown(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        let hdr = Header::new(
            PacketType::Close,
            self.send_seq,
            self.recv_seq,
            self.role == Role::Caller,
            0,
        );
        self.send_seq = next_seq(self.send_seq);
        self.stats.sent += 1;
        if let Err(e) = self.send_ctl(hdr, &[]) {
            warn!("CLOSE not sent: {}", e);
        }
        let s = &self.stats;
        debug!(
            "link down: sent {} (resent {}), received {}, naks {}, errors {}/{}/{}/{}",
            s.sent,
            s.resent,
            s.received,
            s.naks,
            s.bad_header,
            s.bad_checksum,
            s.bad_order,
            s.remote_rejects
        );
    }

    /// The data the session staged in the current slot moves one slot up;
    /// an SPOS carrying the new offset takes its place and goes out first.
    fn stage_spos(&mut self, pos: u64, len: usize, sink: &mut impl Sink) -> Result<(), Error> {
        let cur = self.send_seq as usize;
        let nxt = next_seq(self.send_seq) as usize;
        let (a, b) = pick_two(&mut self.slots, cur, nxt);
        b[HDR_LEN..HDR_LEN + len].copy_from_slice(&a[HDR_LEN..HDR_LEN + len]);
        a[HDR_LEN..HDR_LEN + 4].copy_from_slice(&(pos as u32).to_be_bytes());
        trace!("send SPOS {}", pos);
        self.transmit_slot(PacketType::Spos, 4, sink)?;
        self.send_pos = pos;
        Ok(())
    }

    fn transmit_slot(
        &mut self,
        ptype: PacketType,
        len: usize,
        sink: &mut impl Sink,
    ) -> Result<(), Error> {
        while seq_diff(self.send_seq, self.remote_ack) > self.remote_window {
            let (timeout, retries) = (self.cfg.timeout, self.cfg.retries);
            self.wait_for_packet(sink, Goal::Window, timeout, retries)?;
        }
        let seq = self.send_seq;
        let hdr = Header::new(ptype, seq, self.recv_seq, self.role == Role::Caller, len);
        let total = {
            let slot = &mut self.slots[seq as usize];
            slot[..HDR_LEN].copy_from_slice(&hdr.encode());
            if len > 0 {
                let crc = PAYLOAD_CRC.checksum(&slot[HDR_LEN..HDR_LEN + len]);
                slot[HDR_LEN + len..HDR_LEN + len + TRAILER_LEN]
                    .copy_from_slice(&crc.to_be_bytes());
                HDR_LEN + len + TRAILER_LEN
            } else {
                HDR_LEN
            }
        };
        self.local_ack = self.recv_seq;
        trace!("send {:?} seq {} len {} ack {}", ptype, seq, len, self.recv_seq);
        self.wire(seq as usize, total)?;
        self.send_seq = next_seq(self.send_seq);
        self.stats.sent += 1;
        // whatever the transact pulled in gets decoded right away
        if self.ring.available() > 0 {
            self.process_data(sink)?;
        }
        Ok(())
    }

    /// Put a stored slot on the wire.
    fn wire(&mut self, seq: usize, total: usize) -> Result<(), Error> {
        let Link { port, ring, slots, cfg, .. } = self;
        let n = port.transact(&slots[seq][..total], ring.write_span(), cfg.timeout)?;
        self.ring.commit(n);
        Ok(())
    }

    /// Resend a slot, refreshing the piggybacked ack and the header check
    /// in place.
    fn resend(&mut self, seq: u8) -> Result<(), Error> {
        let total = {
            let slot = &mut self.slots[seq as usize];
            slot[2] = self.recv_seq << 3;
            slot[5] = slot[1] ^ slot[2] ^ slot[3] ^ slot[4];
            let len = ((slot[3] as usize & 0x0f) << 8) | slot[4] as usize;
            HDR_LEN + len + if len > 0 { TRAILER_LEN } else { 0 }
        };
        self.local_ack = self.recv_seq;
        self.stats.resent += 1;
        trace!("resend seq {}", seq);
        self.wire(seq as usize, total)
    }

    fn send_ctl(&mut self, hdr: Header, payload: &[u8]) -> Result<(), Error> {
        let mut frame = [0u8; HDR_LEN + 8];
        frame[..HDR_LEN].copy_from_slice(&hdr.encode());
        let mut total = HDR_LEN;
        if !payload.is_empty() {
            frame[total..total + payload.len()].copy_from_slice(payload);
            total += payload.len();
            let crc = PAYLOAD_CRC.checksum(payload);
            frame[total..total + TRAILER_LEN].copy_from_slice(&crc.to_be_bytes());
            total += TRAILER_LEN;
        }
        self.local_ack = hdr.remote;
        let Link { port, ring, cfg, .. } = self;
        let n = port.transact(&frame[..total], ring.write_span(), cfg.timeout)?;
        self.ring.commit(n);
        Ok(())
    }

    fn send_sync(&mut self) -> Result<(), Error> {
        let hdr = Header::new(
            PacketType::Sync,
            0,
            self.recv_seq,
            self.role == Role::Caller,
            3,
        );
        let payload = [
            (self.cfg.packet_size >> 8) as u8,
            self.cfg.packet_size as u8,
            self.cfg.window,
        ];
        debug!(
            "send SYNC: packet {} window {}",
            self.cfg.packet_size, self.cfg.window
        );
        self.send_ctl(hdr, &payload)
    }

    fn send_ack(&mut self) -> Result<(), Error> {
        trace!("send ACK {}", self.recv_seq);
        let hdr = Header::new(
            PacketType::Ack,
            0,
            self.recv_seq,
            self.role == Role::Caller,
            0,
        );
        // everything through recv_seq is acknowledged now
        let mut s = self.local_ack;
        while s != self.recv_seq {
            s = next_seq(s);
            self.naked[s as usize] = false;
        }
        self.send_ctl(hdr, &[])
    }

    fn send_nak(&mut self, seq: u8) -> Result<(), Error> {
        trace!("send NAK {}", seq);
        self.stats.naks += 1;
        self.naked[seq as usize] = true;
        let hdr = Header::new(
            PacketType::Nak,
            seq,
            self.recv_seq,
            self.role == Role::Caller,
            0,
        );
        self.send_ctl(hdr, &[])
    }

    fn wait_for_packet(
        &mut self,
        sink: &mut impl Sink,
        goal: Goal,
        timeout: Duration,
        retries: u32,
    ) -> Result<(), Error> {
        let mut tries = 0;
        loop {
            let step = self.process_data(sink)?;
            let done = match goal {
                Goal::Delivered => matches!(step, Step::Break),
                Goal::Window => seq_diff(self.send_seq, self.remote_ack) <= self.remote_window,
                Goal::Synced => self.synced,
            };
            if done {
                return Ok(());
            }
            let need = match step {
                Step::More(n) => n,
                Step::Break => continue,
            };
            let got = self.receive_data(timeout)?;
            if got == 0 {
                tries += 1;
                if tries > retries {
                    return Err(Error::TimedOut(retries));
                }
                if !self.synced {
                    self.send_sync()?;
                } else if next_seq(self.remote_ack) != self.send_seq {
                    // the peer is missing something we sent
                    let seq = next_seq(self.remote_ack);
                    warn!("read timed out, resending seq {}", seq);
                    self.resend(seq)?;
                } else {
                    let seq = next_seq(self.recv_seq);
                    warn!("read timed out, asking again for seq {}", seq);
                    self.send_nak(seq)?;
                }
            } else if got < need {
                self.short_reads += 1;
                if self.short_reads >= 2 && self.ring.available() > 0 {
                    // two short reads against the same frame: the intro we
                    // locked onto is probably line noise, slide past it
                    self.ring.consume(1);
                    self.short_reads = 0;
                }
            } else {
                self.short_reads = 0;
            }
        }
    }

    fn receive_data(&mut self, timeout: Duration) -> Result<usize, Error> {
        if self.ring.free() == 0 {
            return Err(Error::Protocol("receive ring full"));
        }
        let Link { port, ring, .. } = self;
        let n = port.read(ring.write_span(), timeout)?;
        self.ring.commit(n);
        Ok(n)
    }

    /// Drain the ring into decoded frames until it runs dry or the sink
    /// asks for control.
    fn process_data(&mut self, sink: &mut impl Sink) -> Result<Step, Error> {
        if self.flush_parked(sink)? == Flow::Break {
            return Ok(Step::Break);
        }
        loop {
            // pre-framing noise carries no information and no penalty
            while self.ring.available() > 0 && self.ring.at(0) != INTRO {
                self.ring.consume(1);
            }
            let avail = self.ring.available();
            if avail < HDR_LEN {
                return Ok(Step::More(HDR_LEN - avail));
            }
            let mut raw = [0u8; HDR_LEN];
            self.ring.copy_to(0, &mut raw);
            if !Header::check_ok(&raw) {
                self.stats.bad_header += 1;
                self.ring.consume(1);
                self.check_errors()?;
                continue;
            }
            let hdr = Header::decode(&raw);
            if hdr.caller == (self.role == Role::Caller) {
                // our own frames coming back at us
                self.stats.bad_header += 1;
                self.ring.consume(1);
                self.check_errors()?;
                continue;
            }
            let total = HDR_LEN + hdr.len + if hdr.len > 0 { TRAILER_LEN } else { 0 };
            if total > self.ring.capacity() - 1 {
                // a length the ring could never hold: not a real header
                self.stats.bad_header += 1;
                self.ring.consume(1);
                self.check_errors()?;
                continue;
            }
            if avail < total {
                return Ok(Step::More(total - avail));
            }
            if hdr.len > 0 {
                let computed = {
                    let (head, tail) = self.ring.spans(HDR_LEN, hdr.len);
                    crc_spans(head, tail)
                };
                let mut trailer = [0u8; TRAILER_LEN];
                self.ring.copy_to(HDR_LEN + hdr.len, &mut trailer);
                if computed != u32::from_be_bytes(trailer) {
                    self.stats.bad_checksum += 1;
                    trace!("bad checksum on seq {}", hdr.local);
                    if PacketType::from_bits(hdr.ptype).map_or(false, PacketType::sequenced) {
                        self.send_nak(hdr.local)?;
                    }
                    self.ring.consume(1);
                    self.check_errors()?;
                    continue;
                }
            }
            self.stats.received += 1;
            trace!(
                "recv type {} seq {} len {} ack {}",
                hdr.ptype,
                hdr.local,
                hdr.len,
                hdr.remote
            );
            // the remote field acknowledges everything through it
            let d_ack = seq_diff(hdr.remote, self.remote_ack);
            if d_ack != 0 && d_ack < seq_diff(self.send_seq, self.remote_ack) {
                self.remote_ack = hdr.remote;
            }
            let flow = match PacketType::from_bits(hdr.ptype) {
                Some(pt) if pt.sequenced() => self.sequenced_arrived(pt, &hdr, total, sink)?,
                Some(PacketType::Sync) => {
                    let again = self.sync_arrived(hdr.len);
                    self.ring.consume(total);
                    if again {
                        self.send_sync()?;
                    }
                    Flow::Continue
                }
                Some(PacketType::Ack) => {
                    self.ring.consume(total);
                    Flow::Continue
                }
                Some(PacketType::Nak) => {
                    self.ring.consume(total);
                    self.nak_arrived(hdr.local)?;
                    Flow::Continue
                }
                _ => {
                    // reserved type: a valid frame we don't speak yet
                    self.ring.consume(total);
                    Flow::Continue
                }
            };
            if flow == Flow::Break {
                return Ok(Step::Break);
            }
        }
    }

    /// A DATA, SPOS or CLOSE frame passed its checks.
    fn sequenced_arrived(
        &mut self,
        pt: PacketType,
        hdr: &Header,
        total: usize,
        sink: &mut impl Sink,
    ) -> Result<Flow, Error> {
        let seq = hdr.local;
        if seq == 0 {
            // zero never names a data frame; noise that passed the check
            self.stats.bad_order += 1;
            self.ring.consume(total);
            self.check_errors()?;
            return Ok(Flow::Continue);
        }
        if seq == next_seq(self.recv_seq) {
            self.recv_seq = seq;
            self.naked[seq as usize] = false;
            let mut flow = Flow::Continue;
            match pt {
                PacketType::Data => {
                    let pos = self.recv_pos;
                    {
                        let (head, tail) = self.ring.spans(HDR_LEN, hdr.len);
                        flow = sink.on_data(head, tail, pos)?;
                    }
                    self.recv_pos += hdr.len as u64;
                }
                PacketType::Spos => {
                    if hdr.len >= 4 {
                        let mut pb = [0u8; 4];
                        self.ring.copy_to(HDR_LEN, &mut pb);
                        self.recv_pos = u32::from_be_bytes(pb) as u64;
                        trace!("recv SPOS {}", self.recv_pos);
                    }
                }
                PacketType::Close => {
                    self.ring.consume(total);
                    return self.close_arrived();
                }
                _ => unreachable!(),
            }
            self.ring.consume(total);
            self.maybe_ack()?;
            if flow == Flow::Break {
                return Ok(Flow::Break);
            }
            self.flush_parked(sink)
        } else {
            let d = seq_diff(seq, self.recv_seq);
            if d == 0 {
                // a duplicate of what we already delivered; the peer only
                // missed our ack, so this costs nothing
                self.ring.consume(total);
                return Ok(Flow::Continue);
            }
            if d > self.cfg.window {
                self.stats.bad_order += 1;
                self.ring.consume(total);
                self.check_errors()?;
                return Ok(Flow::Continue);
            }
            if self.parked[seq as usize].is_none() {
                let mut payload = vec![0u8; hdr.len];
                let (head, tail) = self.ring.spans(HDR_LEN, hdr.len);
                payload[..head.len()].copy_from_slice(head);
                payload[head.len()..].copy_from_slice(tail);
                self.parked[seq as usize] = Some((pt, payload));
            }
            self.naked[seq as usize] = false;
            self.ring.consume(total);
            // ask once for everything missing below the newcomer
            let mut s = next_seq(self.recv_seq);
            while s != seq {
                if self.parked[s as usize].is_none() && !self.naked[s as usize] {
                    self.send_nak(s)?;
                }
                s = next_seq(s);
            }
            Ok(Flow::Continue)
        }
    }

    /// Deliver parked frames that have become contiguous.
    fn flush_parked(&mut self, sink: &mut impl Sink) -> Result<Flow, Error> {
        loop {
            let nxt = next_seq(self.recv_seq) as usize;
            let Some((pt, payload)) = self.parked[nxt].take() else {
                return Ok(Flow::Continue);
            };
            self.recv_seq = nxt as u8;
            self.naked[nxt] = false;
            let mut flow = Flow::Continue;
            match pt {
                PacketType::Data => {
                    let pos = self.recv_pos;
                    flow = sink.on_data(&payload, &[], pos)?;
                    self.recv_pos += payload.len() as u64;
                }
                PacketType::Spos => {
                    if payload.len() >= 4 {
                        self.recv_pos =
                            u32::from_be_bytes(payload[..4].try_into().unwrap()) as u64;
                        trace!("recv SPOS {}", self.recv_pos);
                    }
                }
                PacketType::Close => return self.close_arrived(),
                _ => {}
            }
            self.maybe_ack()?;
            if flow == Flow::Break {
                return Ok(Flow::Break);
            }
        }
    }

    /// Returns whether our own SYNC should be repeated.
    fn sync_arrived(&mut self, len: usize) -> bool {
        if len >= 3 {
            let mut pb = [0u8; 3];
            self.ring.copy_to(HDR_LEN, &mut pb);
            let packet = ((pb[0] as usize) << 8) | pb[1] as usize;
            self.remote_packet = if self.cfg.remote_packet_size != 0 {
                self.cfg.remote_packet_size
            } else {
                packet.clamp(MIN_PACKET, MAX_PAYLOAD)
            };
            if !self.slots.is_empty() {
                // a late SYNC cannot grow frames past the slots we hold
                let cap = self.slots[0].len() - HDR_LEN - TRAILER_LEN;
                self.remote_packet = self.remote_packet.min(cap);
            }
            self.remote_window = if self.cfg.remote_window != 0 {
                self.cfg.remote_window
            } else {
                pb[2].clamp(1, 31)
            };
            debug!(
                "peer SYNC: packet {} window {}",
                self.remote_packet, self.remote_window
            );
        }
        // a repeated SYNC means the peer never saw ours
        let again = self.synced;
        self.synced = true;
        again
    }

    fn nak_arrived(&mut self, seq: u8) -> Result<(), Error> {
        self.stats.remote_rejects += 1;
        // only frames still awaiting acknowledgement can be resent
        let d = seq_diff(seq, self.remote_ack);
        if d != 0 && d < seq_diff(self.send_seq, self.remote_ack) {
            self.resend(seq)?;
        }
        self.check_errors()
    }

    fn close_arrived(&mut self) -> Result<Flow, Error> {
        if self.closing {
            debug!("peer closed");
            Ok(Flow::Break)
        } else {
            error!("unexpected CLOSE from peer");
            Err(Error::ClosedByPeer)
        }
    }

    /// A standalone ACK goes out once the unacknowledged span covers half
    /// the window; piggybacking handles the rest.
    fn maybe_ack(&mut self) -> Result<(), Error> {
        let d = seq_diff(self.recv_seq, self.local_ack);
        if d > 0 && d >= self.remote_window / 2 {
            self.send_ack()?;
        }
        Ok(())
    }

    fn check_errors(&mut self) -> Result<(), Error> {
        let s = &self.stats;
        let errors = (s.bad_header + s.bad_checksum + s.bad_order + s.remote_rejects) as i64
            - (s.received / self.cfg.error_decay) as i64;
        if errors > self.cfg.max_errors as i64 {
            error!(
                "too many link errors: {} header, {} checksum, {} order, {} rejects",
                s.bad_header, s.bad_checksum, s.bad_order, s.remote_rejects
            );
            return Err(Error::ErrorBudget(errors as u64 - self.cfg.max_errors));
        }
        Ok(())
    }
}

/// Mutable views of two distinct slots.
fn pick_two(slots: &mut [Vec<u8>], a: usize, b: usize) -> (&mut Vec<u8>, &mut Vec<u8>) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = slots.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = slots.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

/// Next flow-controlled sequence number. Zero is reserved for SYNC and
/// ACK frames and never names data, so the cycle is 1..=31.
fn next_seq(seq: u8) -> u8 {
    let n = (seq + 1) & 31;
    if n == 0 {
        1
    } else {
        n
    }
}

/// Distance from `b` forward to `a` on the 32-wide sequence ring.
fn seq_diff(a: u8, b: u8) -> u8 {
    (a + 32 - b) & 31
}
