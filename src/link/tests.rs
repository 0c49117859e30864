use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::RngCore;

use super::packet::PAYLOAD_CRC;
use super::*;
use crate::port::mem::{pair, MemPort};
use crate::port::Port;
use crate::{Config, Error};

/// Sink that keeps what the link delivers.
#[derive(Default)]
struct Trap {
    data: Vec<u8>,
    writes: Vec<(u64, usize)>,
    done: bool,
}

impl Sink for Trap {
    fn on_data(&mut self, head: &[u8], tail: &[u8], pos: u64) -> Result<Flow, Error> {
        if head.is_empty() && tail.is_empty() {
            self.done = true;
            return Ok(Flow::Break);
        }
        self.writes.push((pos, head.len() + tail.len()));
        let pos = pos as usize;
        if self.data.len() < pos {
            self.data.resize(pos, 0);
        }
        self.data.truncate(pos);
        self.data.extend_from_slice(head);
        self.data.extend_from_slice(tail);
        Ok(Flow::Continue)
    }
}

fn quick() -> Config {
    Config {
        timeout: Duration::from_millis(40),
        retries: 3,
        sync_timeout: Duration::from_millis(200),
        sync_retries: 5,
        ..Config::default()
    }
}

fn start_pair<PA, PB>(pa: PA, pb: PB, ca: Config, cb: Config) -> (Link<PA>, Trap, Link<PB>, Trap)
where
    PA: Port,
    PB: Port + Send + 'static,
{
    let answer = thread::spawn(move || {
        let mut tb = Trap::default();
        let b = Link::start(pb, Role::Called, cb, &mut tb).unwrap();
        (b, tb)
    });
    let mut ta = Trap::default();
    let a = Link::start(pa, Role::Caller, ca, &mut ta).unwrap();
    let (b, tb) = answer.join().unwrap();
    (a, ta, b, tb)
}

/// Drain everything currently queued for `link` without blocking on the
/// far side.
fn pump<P: Port>(link: &mut Link<P>, sink: &mut Trap) {
    loop {
        let got = link.receive_data(Duration::from_millis(1)).unwrap();
        link.process_data(sink).unwrap();
        if got == 0 {
            break;
        }
    }
}

fn frame(ptype: PacketType, local: u8, remote: u8, caller: bool, payload: &[u8]) -> Vec<u8> {
    let hdr = Header::new(ptype, local, remote, caller, payload.len());
    let mut v = hdr.encode().to_vec();
    if !payload.is_empty() {
        v.extend_from_slice(payload);
        v.extend_from_slice(&PAYLOAD_CRC.checksum(payload).to_be_bytes());
    }
    v
}

#[test]
fn clean_transfer_is_exact() {
    let (pa, pb) = pair();
    let (mut a, mut ta, mut b, mut tb) = start_pair(pa, pb, quick(), quick());
    let sent0 = a.stats.sent;
    let rcvd0 = b.stats.received;

    let file: Vec<u8> = (0..131_072usize).map(|i| i as u8).collect();
    let mut off = 0;
    loop {
        let space = a.get_space();
        let n = space.len().min(file.len() - off);
        space[..n].copy_from_slice(&file[off..off + n]);
        a.send_data(n, Some(off as u64), &mut ta).unwrap();
        off += n;
        pump(&mut b, &mut tb);
        if n == 0 {
            break;
        }
    }

    assert!(tb.done);
    assert_eq!(tb.data, file);
    // 128 full frames and the empty end-of-file frame
    assert_eq!(a.stats.sent - sent0, 129);
    assert_eq!(b.stats.received - rcvd0, 129);
    assert_eq!(a.stats.resent, 0);
    assert_eq!(b.stats.bad_checksum, 0);
}

/// Flips one bit in every 100th inbound byte once armed, up to a cutoff.
struct Mangler {
    inner: MemPort,
    armed: Arc<AtomicBool>,
    seen: usize,
    until: usize,
}

impl Mangler {
    fn mangle(&mut self, buf: &mut [u8]) {
        for b in buf {
            if self.armed.load(Ordering::Relaxed) && self.seen < self.until && self.seen % 100 == 0
            {
                *b ^= 0x01;
            }
            self.seen += 1;
        }
    }
}

impl Port for Mangler {
    fn transact(
        &mut self,
        send: &[u8],
        recv: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        let n = self.inner.transact(send, recv, timeout)?;
        self.mangle(&mut recv[..n]);
        Ok(n)
    }

    fn read(&mut self, recv: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        let n = self.inner.read(recv, timeout)?;
        self.mangle(&mut recv[..n]);
        Ok(n)
    }
}

#[test]
fn corrupted_input_is_retransmitted() {
    let (pa, pb) = pair();
    let armed = Arc::new(AtomicBool::new(false));
    let pb = Mangler { inner: pb, armed: armed.clone(), seen: 0, until: 60_000 };
    let mut cfg = quick();
    cfg.max_errors = 10_000;
    let (mut a, mut ta, mut b, mut tb) = start_pair(pa, pb, cfg.clone(), cfg);
    armed.store(true, Ordering::Relaxed);

    let file: Vec<u8> = (0..131_072usize).map(|i| (i * 31) as u8).collect();
    let mut off = 0;
    loop {
        let space = a.get_space();
        let n = space.len().min(file.len() - off);
        space[..n].copy_from_slice(&file[off..off + n]);
        a.send_data(n, Some(off as u64), &mut ta).unwrap();
        off += n;
        pump(&mut b, &mut tb);
        pump(&mut a, &mut ta);
        if n == 0 {
            break;
        }
    }
    let mut rounds = 0;
    while !tb.done && rounds < 500 {
        pump(&mut a, &mut ta);
        pump(&mut b, &mut tb);
        rounds += 1;
    }

    assert!(tb.done);
    assert_eq!(tb.data, file);
    assert!(b.stats.bad_checksum > 0);
    assert!(a.stats.resent >= b.stats.bad_checksum);
}

#[test]
fn window_blocks_against_a_silent_peer() {
    let (pa, pb) = pair();
    let mut cb = quick();
    cb.window = 4;
    let (mut a, mut ta, _b, _tb) = start_pair(pa, pb, quick(), cb);

    // the peer never drains; after four frames the window is shut and
    // the sender must eventually give up
    let mut err = None;
    for i in 0..10u8 {
        let space = a.get_space();
        space[..8].fill(i);
        match a.send_data(8, None, &mut ta) {
            Ok(()) => {}
            Err(e) => {
                err = Some(e);
                break;
            }
        }
    }
    assert!(matches!(err, Some(Error::TimedOut(_))));
    assert_eq!(a.stats.sent, 4);
    assert!(a.stats.resent > 0);
}

/// Swallows the nth outbound transact whole, as if the line ate a frame.
struct Skipper {
    inner: MemPort,
    drop_nth: usize,
    count: usize,
}

impl Port for Skipper {
    fn transact(
        &mut self,
        send: &[u8],
        recv: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.count += 1;
        if self.count == self.drop_nth {
            return self.inner.read(recv, Duration::ZERO);
        }
        self.inner.transact(send, recv, timeout)
    }

    fn read(&mut self, recv: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        self.inner.read(recv, timeout)
    }
}

#[test]
fn one_nak_per_missing_sequence() {
    let (pa, pb) = pair();
    // transact 1 is the SYNC; data frames start at 2, so this eats seq 2
    let pa = Skipper { inner: pa, drop_nth: 3, count: 0 };
    let (mut a, mut ta, mut b, mut tb) = start_pair(pa, pb, quick(), quick());

    for i in 0..4u8 {
        let space = a.get_space();
        space[..4].fill(i);
        a.send_data(4, None, &mut ta).unwrap();
        pump(&mut b, &mut tb);
    }
    pump(&mut a, &mut ta);
    pump(&mut b, &mut tb);

    // sequences 3 and 4 waited behind the hole; exactly one NAK asked
    // for 2, and exactly one retransmission answered it
    assert_eq!(tb.data.len(), 16);
    assert_eq!(b.stats.naks, 1);
    assert_eq!(a.stats.resent, 1);
}

#[test]
fn framing_noise_is_skipped_and_counted() {
    let (mut pa, pb) = pair();
    let mut cfg = quick();
    cfg.max_errors = 10_000;
    let cb = cfg.clone();
    let answer = thread::spawn(move || {
        let mut tb = Trap::default();
        let b = Link::start(pb, Role::Called, cb, &mut tb).unwrap();
        (b, tb)
    });
    let mut scratch = [0u8; 64];
    let sync = frame(PacketType::Sync, 0, 0, true, &[0x04, 0x00, 16]);
    pa.transact(&sync, &mut scratch, Duration::from_millis(10)).unwrap();
    let (mut b, mut tb) = answer.join().unwrap();

    // intro bytes leading headers whose check byte is wrong
    let unit = [INTRO, 0x11, 0x22, 0x33, 0x44, 0x00];
    let mut noise = Vec::new();
    for _ in 0..40 {
        noise.extend_from_slice(&unit);
    }
    pa.transact(&noise, &mut scratch, Duration::from_millis(10)).unwrap();
    pump(&mut b, &mut tb);
    assert!(b.stats.bad_header > 0);

    let data = frame(PacketType::Data, 1, 0, true, b"hello");
    pa.transact(&data, &mut scratch, Duration::from_millis(10)).unwrap();
    pump(&mut b, &mut tb);
    assert_eq!(tb.data, b"hello");
}

#[test]
fn duplicate_frames_cost_nothing() {
    let (mut pa, pb) = pair();
    let cb = quick();
    let answer = thread::spawn(move || {
        let mut tb = Trap::default();
        let b = Link::start(pb, Role::Called, cb, &mut tb).unwrap();
        (b, tb)
    });
    let mut scratch = [0u8; 64];
    let sync = frame(PacketType::Sync, 0, 0, true, &[0x04, 0x00, 16]);
    pa.transact(&sync, &mut scratch, Duration::from_millis(10)).unwrap();
    let (mut b, mut tb) = answer.join().unwrap();

    // the peer resends a frame whose ack it never saw; the copy is
    // dropped without touching the error counters
    let data = frame(PacketType::Data, 1, 0, true, b"hello");
    pa.transact(&data, &mut scratch, Duration::from_millis(10)).unwrap();
    pump(&mut b, &mut tb);
    pa.transact(&data, &mut scratch, Duration::from_millis(10)).unwrap();
    pump(&mut b, &mut tb);

    assert_eq!(tb.data, b"hello");
    assert_eq!(b.stats.bad_order, 0);
    assert_eq!(b.stats.bad_header, 0);
}

#[test]
fn random_noise_never_panics() {
    let (mut pa, pb) = pair();
    let mut cfg = quick();
    cfg.max_errors = 1_000_000;
    let cb = cfg.clone();
    let answer = thread::spawn(move || {
        let mut tb = Trap::default();
        let b = Link::start(pb, Role::Called, cb, &mut tb).unwrap();
        (b, tb)
    });
    let mut scratch = [0u8; 64];
    let sync = frame(PacketType::Sync, 0, 0, true, &[0x04, 0x00, 16]);
    pa.transact(&sync, &mut scratch, Duration::from_millis(10)).unwrap();
    let (mut b, mut tb) = answer.join().unwrap();

    let mut rng = rand::thread_rng();
    let mut noise = vec![0u8; 4096];
    rng.fill_bytes(&mut noise);
    pa.transact(&noise, &mut scratch, Duration::from_millis(10)).unwrap();
    for _ in 0..10_000 {
        let got = b.receive_data(Duration::from_millis(1)).unwrap();
        if b.process_data(&mut tb).is_err() {
            break;
        }
        if got == 0 {
            break;
        }
    }
    // whatever the noise decoded as, the decoder got through it
}

#[test]
fn spos_repositions_the_receiver() {
    let (pa, pb) = pair();
    let (mut a, mut ta, mut b, mut tb) = start_pair(pa, pb, quick(), quick());

    let payload = [0xAB; 512];
    let space = a.get_space();
    space[..512].copy_from_slice(&payload);
    a.send_data(512, Some(0), &mut ta).unwrap();
    let space = a.get_space();
    space[..512].copy_from_slice(&payload);
    a.send_data(512, Some(4096), &mut ta).unwrap();
    a.send_data(0, Some(4608), &mut ta).unwrap();
    pump(&mut b, &mut tb);

    assert!(tb.done);
    assert_eq!(tb.writes, vec![(0, 512), (4096, 512)]);
    assert_eq!(tb.data.len(), 4608);
    assert_eq!(&tb.data[4096..], &payload[..]);
    assert!(tb.data[512..4096].iter().all(|&x| x == 0));
    // data, SPOS, data, end of file
    assert_eq!(a.stats.sent, 4);
}

#[test]
fn maximum_payload_round_trip() {
    let mut cfg = quick();
    cfg.packet_size = MAX_PAYLOAD;
    let (pa, pb) = pair();
    let (mut a, mut ta, mut b, mut tb) = start_pair(pa, pb, cfg.clone(), cfg);

    let mut payload = vec![0u8; MAX_PAYLOAD];
    rand::thread_rng().fill_bytes(&mut payload);
    let space = a.get_space();
    assert_eq!(space.len(), MAX_PAYLOAD);
    space.copy_from_slice(&payload);
    a.send_data(MAX_PAYLOAD, None, &mut ta).unwrap();
    a.send_data(0, None, &mut ta).unwrap();
    pump(&mut b, &mut tb);

    assert!(tb.done);
    assert_eq!(tb.data, payload);
}

#[test]
fn sequence_arithmetic() {
    assert_eq!(next_seq(0), 1);
    assert_eq!(next_seq(1), 2);
    // zero never names a data frame
    assert_eq!(next_seq(31), 1);
    assert_eq!(seq_diff(5, 3), 2);
    assert_eq!(seq_diff(3, 5), 30);
    assert_eq!(seq_diff(7, 7), 0);
    assert_eq!(seq_diff(1, 31), 2);
}

#[test]
fn error_budget_decays_with_received_traffic() {
    let (pa, pb) = pair();
    let (mut a, _ta, _b, _tb) = start_pair(pa, pb, quick(), quick());
    a.stats.received = 0;
    a.stats.bad_header = 90;
    a.stats.bad_checksum = 10;
    assert!(a.check_errors().is_ok());
    a.stats.bad_order += 1;
    assert!(a.check_errors().is_err());
    // ten good frames forgive one error
    a.stats.received = 10;
    assert!(a.check_errors().is_ok());
}
