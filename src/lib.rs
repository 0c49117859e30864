//! Store-and-forward file transfer between two peers on an unreliable
//! byte-stream link.
//!
//! The crate is two layers. [`Link`] turns a raw [`Port`] into a
//! reliable, ordered packet stream: sliding window, CRC-32 payload
//! checks, negative acknowledgement and retransmission. [`Session`]
//! speaks the transfer command grammar on top of it: send, receive and
//! execute requests with their accept/reject replies, transfer
//! confirmations, and the hangup handshake that ends a conversation.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::Duration;

use log::{debug, info, warn};

mod cmd;
mod err;
mod fs;
mod link;
mod port;

pub use cmd::{Command, ExecRequest, RecvRequest, Reply, SendRequest};
pub use err::Error;
pub use fs::{FileStore, LocalFs};
pub use link::{Flow, Link, Role, Sink, Stats};
pub use port::{FdPort, Port};


/// Protocol and policy knobs. `Default` matches the standard wire
/// parameters; both peers announce theirs during the SYNC exchange and
/// each side honors what the other announced unless forced here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest payload we are willing to receive, at most 4095.
    pub packet_size: usize,
    /// Receive window announced to the peer, 1..=31.
    pub window: u8,
    /// Force the peer's packet size instead of honoring its SYNC (0 =
    /// honor).
    pub remote_packet_size: usize,
    /// Force the peer's window instead of honoring its SYNC (0 = honor).
    pub remote_window: u8,
    /// How long each SYNC waits for an answer.
    pub sync_timeout: Duration,
    pub sync_retries: u32,
    /// How long a single read may wait before the loop retransmits.
    pub timeout: Duration,
    /// Consecutive read timeouts tolerated before the link is declared
    /// dead.
    pub retries: u32,
    /// Error budget: the link fails once uncompensated errors pass this.
    pub max_errors: u64,
    /// Received packets forgiving one error each.
    pub error_decay: u64,
    /// Refuse incoming files declared larger than this with `SN6`.
    pub max_receive_size: Option<u64>,
    /// Whether `X` requests are honored.
    pub permit_exec: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            packet_size: 1024,
            window: 16,
            remote_packet_size: 0,
            remote_window: 0,
            sync_timeout: Duration::from_secs(10),
            sync_retries: 6,
            timeout: Duration::from_secs(10),
            retries: 6,
            max_errors: 100,
            error_decay: 10,
            max_receive_size: None,
            permit_exec: true,
        }
    }
}

/// How a requested transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Confirmed by the peer.
    Done { bytes: u64 },
    /// Rejected for a transient reason; keep the work and retry later.
    Deferred { code: u8 },
    /// Rejected for good; drop the work.
    Refused { code: u8 },
}

/// The link's upcall target: assembles inbound command strings and writes
/// receive-file data.
struct Pump<D> {
    cmds: VecDeque<String>,
    partial: Vec<u8>,
    file: Option<D>,
    wrote_to: u64,
    received_bytes: u64,
    received_error: bool,
    file_done: bool,
}

impl<D> Pump<D> {
    fn new() -> Pump<D> {
        Pump {
            cmds: VecDeque::new(),
            partial: Vec::new(),
            file: None,
            wrote_to: 0,
            received_bytes: 0,
            received_error: false,
            file_done: false,
        }
    }

    fn open(&mut self, dest: D) {
        self.file = Some(dest);
        self.wrote_to = 0;
        self.received_bytes = 0;
        self.received_error = false;
        self.file_done = false;
    }

    fn close(&mut self) -> (D, u64, bool) {
        (self.file.take().unwrap(), self.received_bytes, self.received_error)
    }
}

impl<D: Write + Seek> Sink for Pump<D> {
    fn on_data(&mut self, head: &[u8], tail: &[u8], pos: u64) -> Result<Flow, Error> {
        let Some(file) = self.file.as_mut() else {
            // no file open: these bytes are a command in the making
            for &b in head.iter().chain(tail) {
                if b == 0 {
                    let cmd = String::from_utf8_lossy(&self.partial).into_owned();
                    self.partial.clear();
                    debug!("command received {:?}", cmd);
                    self.cmds.push_back(cmd);
                    return Ok(Flow::Break);
                }
                self.partial.push(b);
            }
            return Ok(Flow::Continue);
        };
        if head.is_empty() && tail.is_empty() {
            self.file_done = true;
            return Ok(Flow::Break);
        }
        if !self.received_error {
            let wrote = (|| {
                if pos != self.wrote_to {
                    file.seek(SeekFrom::Start(pos))?;
                }
                file.write_all(head)?;
                file.write_all(tail)
            })();
            if let Err(e) = wrote {
                // keep draining; the confirmation will carry the bad news
                warn!("receive file write failed: {}", e);
                self.received_error = true;
            }
        }
        let len = (head.len() + tail.len()) as u64;
        self.wrote_to = pos + len;
        self.received_bytes += len;
        Ok(Flow::Continue)
    }
}

/// One conversation over an established link.
///
/// The peer that placed the call stays the [`Role::Caller`] for the life
/// of the session; either peer may master individual transfers. A master
/// drives [`send_file`]/[`recv_file`]/[`execute`], the other side answers
/// from [`serve`].
///
/// [`send_file`]: Session::send_file
/// [`recv_file`]: Session::recv_file
/// [`execute`]: Session::execute
/// [`serve`]: Session::serve
pub struct Session<P: Port, F: FileStore> {
    link: Link<P>,
    fs: F,
    pump: Pump<F::Dest>,
    cfg: Config,
}

impl<P: Port, F: FileStore> Session<P, F> {
    /// Bring the link up (SYNC exchange) and wrap it in a session.
    pub fn start(port: P, fs: F, role: Role, cfg: Config) -> Result<Session<P, F>, Error> {
        let mut pump = Pump::new();
        let link = Link::start(port, role, cfg.clone(), &mut pump)?;
        Ok(Session { link, fs, pump, cfg })
    }

    pub fn stats(&self) -> &Stats {
        self.link.stats()
    }

    /// Master side of `S`: offer a file, stream it on `SY`, and wait for
    /// the receiver's verdict.
    pub fn send_file(&mut self, req: &SendRequest) -> Result<Outcome, Error> {
        let (mut src, size, mode) = self.fs.open_send(&req.from).map_err(Error::File)?;
        let mut wire = req.clone();
        if wire.mode == 0 {
            wire.mode = mode;
        }
        if wire.size.is_none() {
            wire.size = Some(size);
        }
        self.link.send_cmd(&Command::Send(wire).to_string(), &mut self.pump)?;
        let reply = match self.read_cmd()? {
            Command::SendReply(r) => r,
            other => return Err(unexpected(other)),
        };
        if let Reply::No { code } = reply {
            return Ok(refused("send", code));
        }
        info!("sending {} ({} bytes)", req.from, size);
        let outcome = self.push(&mut src, req.position)?;
        if let Outcome::Done { bytes } = outcome {
            info!("sent {} ({} bytes)", req.from, bytes);
        }
        Ok(outcome)
    }

    /// Master side of `R`: ask for a file and pull it down.
    pub fn recv_file(&mut self, req: &RecvRequest) -> Result<Outcome, Error> {
        self.link.send_cmd(&Command::Recv(req.clone()).to_string(), &mut self.pump)?;
        let reply = match self.read_cmd()? {
            Command::RecvReply(r) => r,
            other => return Err(unexpected(other)),
        };
        let mode = match reply {
            Reply::No { code } => return Ok(refused("receive", code)),
            Reply::Yes { mode } => mode,
        };
        let to = req.to.clone();
        let dest = self.fs.open_recv(&to, mode).map_err(Error::File)?;
        self.pump.open(dest);
        self.drain_file(&to)
    }

    /// Master side of `X`: ask the peer to run a spooled execution.
    pub fn execute(&mut self, req: &ExecRequest) -> Result<Outcome, Error> {
        self.link.send_cmd(&Command::Exec(req.clone()).to_string(), &mut self.pump)?;
        match self.read_cmd()? {
            Command::ExecReply(true) => Ok(Outcome::Done { bytes: 0 }),
            Command::ExecReply(false) => {
                warn!("execution refused by peer");
                Ok(Outcome::Refused { code: 0 })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Answer the peer's requests until it hangs up.
    pub fn serve(&mut self) -> Result<(), Error> {
        loop {
            match self.read_cmd()? {
                Command::Send(req) => self.answer_send(&req)?,
                Command::Recv(req) => self.answer_recv(&req)?,
                Command::Exec(req) => self.answer_exec(&req)?,
                Command::Hangup => {
                    self.answer_hangup()?;
                    return Ok(());
                }
                Command::HangupYes => {
                    // a stray reply; note it and carry on
                    info!("got hangup reply as master");
                }
                other => return Err(unexpected(other)),
            }
        }
    }

    /// Ask the peer to hang up. Returns false when it declines.
    pub fn hangup(&mut self) -> Result<bool, Error> {
        self.link.send_cmd(&Command::Hangup.to_string(), &mut self.pump)?;
        match self.read_cmd()? {
            Command::HangupNo => {
                debug!("peer declined to hang up");
                return Ok(false);
            }
            Command::HangupYes => {}
            other => return Err(unexpected(other)),
        }
        self.link.send_cmd(&Command::HangupYes.to_string(), &mut self.pump)?;
        match self.read_cmd()? {
            Command::HangupYes => {}
            other => return Err(unexpected(other)),
        }
        self.link.shutdown();
        Ok(true)
    }

    /// Next fully assembled command from the peer.
    fn read_cmd(&mut self) -> Result<Command, Error> {
        loop {
            if let Some(s) = self.pump.cmds.pop_front() {
                return Command::parse(&s);
            }
            self.link.wait(&mut self.pump)?;
        }
    }

    /// Stream an open file over the link and collect the confirmation.
    fn push(&mut self, src: &mut F::Source, start: u64) -> Result<Outcome, Error> {
        if start > 0 {
            src.seek(SeekFrom::Start(start)).map_err(Error::File)?;
        }
        let mut pos = start;
        loop {
            let space = self.link.get_space();
            let n = read_fill(src, space).map_err(Error::File)?;
            self.link.send_data(n, Some(pos), &mut self.pump)?;
            pos += n as u64;
            if n == 0 {
                // the empty frame tells the receiver the file is complete
                break;
            }
        }
        match self.read_cmd()? {
            Command::Confirm(true) => Ok(Outcome::Done { bytes: pos - start }),
            Command::Confirm(false) => {
                warn!("remote end failed to store the file");
                Ok(Outcome::Refused { code: 5 })
            }
            other => Err(unexpected(other)),
        }
    }

    /// Pull the incoming file to completion, settle it in the store, and
    /// confirm either way.
    fn drain_file(&mut self, path: &str) -> Result<Outcome, Error> {
        while !self.pump.file_done {
            self.link.wait(&mut self.pump)?;
        }
        let (dest, bytes, write_failed) = self.pump.close();
        let ok = if write_failed {
            self.fs.discard(dest);
            false
        } else if let Err(e) = self.fs.commit(dest) {
            warn!("could not move {} into place: {}", path, e);
            false
        } else {
            true
        };
        self.link.send_cmd(&Command::Confirm(ok).to_string(), &mut self.pump)?;
        if ok {
            info!("received {} ({} bytes)", path, bytes);
            Ok(Outcome::Done { bytes })
        } else {
            Ok(Outcome::Refused { code: 5 })
        }
    }

    fn answer_send(&mut self, req: &SendRequest) -> Result<(), Error> {
        if let (Some(limit), Some(size)) = (self.cfg.max_receive_size, req.size) {
            if size > limit {
                debug!("refusing {}: {} bytes is over the limit", req.to, size);
                return self.reply(Command::SendReply(Reply::No { code: 6 }));
            }
        }
        let dest = match self.fs.open_recv(&req.to, req.mode) {
            Ok(d) => d,
            Err(e) => {
                let code = match e.kind() {
                    io::ErrorKind::PermissionDenied => 2,
                    io::ErrorKind::NotFound => 4,
                    _ => 0,
                };
                warn!("cannot receive {}: {}", req.to, e);
                return self.reply(Command::SendReply(Reply::No { code }));
            }
        };
        self.reply(Command::SendReply(Reply::Yes { mode: req.mode }))?;
        self.pump.open(dest);
        self.drain_file(&req.to)?;
        Ok(())
    }

    fn answer_recv(&mut self, req: &RecvRequest) -> Result<(), Error> {
        let (mut src, size, mode) = match self.fs.open_send(&req.from) {
            Ok(x) => x,
            Err(e) => {
                let code = if e.kind() == io::ErrorKind::NotFound { 2 } else { 0 };
                warn!("cannot send {}: {}", req.from, e);
                return self.reply(Command::RecvReply(Reply::No { code }));
            }
        };
        if let Some(limit) = req.size {
            if size > limit {
                debug!("refusing to send {}: {} bytes over the caller's limit", req.from, size);
                return self.reply(Command::RecvReply(Reply::No { code: 6 }));
            }
        }
        self.reply(Command::RecvReply(Reply::Yes { mode }))?;
        self.push(&mut src, 0)?;
        Ok(())
    }

    fn answer_exec(&mut self, req: &ExecRequest) -> Result<(), Error> {
        if self.cfg.permit_exec {
            info!("execution request {} from {}", req.from, req.user);
        } else {
            warn!("refusing execution request from {}", req.user);
        }
        self.reply(Command::ExecReply(self.cfg.permit_exec))
    }

    fn answer_hangup(&mut self) -> Result<(), Error> {
        self.link.send_cmd(&Command::HangupYes.to_string(), &mut self.pump)?;
        match self.read_cmd()? {
            Command::HangupYes => {}
            other => return Err(unexpected(other)),
        }
        self.link.send_cmd(&Command::HangupYes.to_string(), &mut self.pump)?;
        self.link.shutdown();
        Ok(())
    }

    fn reply(&mut self, cmd: Command) -> Result<(), Error> {
        self.link.send_cmd(&cmd.to_string(), &mut self.pump)
    }
}

fn refused(kind: &str, code: u8) -> Outcome {
    let reason = match code {
        6 => "file too big",
        4 => "cannot create a work file",
        2 => "permission denied or no such file",
        _ => "peer said no",
    };
    if (Reply::No { code }).retriable() {
        warn!("{} refused: {}, keeping the work for later", kind, reason);
        Outcome::Deferred { code }
    } else {
        warn!("{} refused: {}", kind, reason);
        Outcome::Refused { code }
    }
}

fn unexpected(cmd: Command) -> Error {
    warn!("unexpected command from peer: {:?}", cmd);
    Error::Protocol("unexpected command from peer")
}

fn read_fill<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match src.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}
