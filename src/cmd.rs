use std::fmt;
use std::str::SplitWhitespace;

use crate::err::Error;

/// A session command, as exchanged in NUL-terminated ASCII strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `S from to user -options temp 0mode notify [size]`
    Send(SendRequest),
    /// `R from to user -options [size]`
    Recv(RecvRequest),
    /// `X from to user -options`
    Exec(ExecRequest),
    /// `SY 0mode` or `SN`, `SN2`, `SN4`, `SN6`
    SendReply(Reply),
    /// `RY 0mode` or `RN`, `RN2`, `RN6`
    RecvReply(Reply),
    /// `XY` or `XN`
    ExecReply(bool),
    /// `CY` on a stored file, `CN5` when the final move failed
    Confirm(bool),
    /// `H`
    Hangup,
    /// `HY`
    HangupYes,
    /// `HN`
    HangupNo,
}

/// Offer a file to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub from: String,
    pub to: String,
    pub user: String,
    /// Option letters, without the leading dash.
    pub options: String,
    /// Spool name of the file on the sending side.
    pub temp: String,
    /// File mode; 0 means take it from the file itself.
    pub mode: u32,
    /// Who to notify on the remote side, if anyone.
    pub notify: String,
    pub size: Option<u64>,
    /// Restart offset within the file. Not part of the wire command: a
    /// non-zero position is announced with an SPOS frame before the first
    /// byte of data.
    pub position: u64,
}

impl Default for SendRequest {
    fn default() -> SendRequest {
        SendRequest {
            from: String::new(),
            to: String::new(),
            user: String::new(),
            options: String::new(),
            temp: "D.0".to_string(),
            mode: 0,
            notify: String::new(),
            size: None,
            position: 0,
        }
    }
}

/// Ask the peer for a file. `size` caps what we are willing to take.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecvRequest {
    pub from: String,
    pub to: String,
    pub user: String,
    pub options: String,
    pub size: Option<u64>,
}

/// Ask the peer to run a spooled execution on our behalf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub from: String,
    pub to: String,
    pub user: String,
    pub options: String,
}

/// Accept or reject for `S` and `R` requests. Reject codes follow the
/// wire digits; 0 stands for the bare `SN`/`RN` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Yes { mode: u32 },
    No { code: u8 },
}

impl Reply {
    /// `SN4` (no work file) and `SN6`/`RN6` (too large) leave the work
    /// record in place for a later retry; every other rejection discards
    /// it.
    pub fn retriable(&self) -> bool {
        matches!(self, Reply::No { code: 4 } | Reply::No { code: 6 })
    }
}

impl Command {
    pub fn parse(s: &str) -> Result<Command, Error> {
        let mut it = s.split_whitespace();
        let head = it.next().ok_or_else(|| bad(s))?;
        let cmd = match head {
            "S" => {
                let from = field(&mut it, s)?;
                let to = field(&mut it, s)?;
                let user = field(&mut it, s)?;
                let options = options(&mut it, s)?;
                let temp = field(&mut it, s)?;
                let mode = octal(&mut it, s)?;
                let rest: Vec<&str> = it.collect();
                let (notify, size) = match rest.len() {
                    0 => (String::new(), None),
                    1 => (unquote(rest[0]), None),
                    2 => (unquote(rest[0]), Some(number(rest[1], s)?)),
                    _ => return Err(bad(s)),
                };
                Command::Send(SendRequest {
                    from,
                    to,
                    user,
                    options,
                    temp,
                    mode,
                    notify,
                    size,
                    position: 0,
                })
            }
            "R" => {
                let from = field(&mut it, s)?;
                let to = field(&mut it, s)?;
                let user = field(&mut it, s)?;
                let options = options(&mut it, s)?;
                let size = match it.next() {
                    Some(tok) => Some(number(tok, s)?),
                    None => None,
                };
                Command::Recv(RecvRequest { from, to, user, options, size })
            }
            "X" => {
                let from = field(&mut it, s)?;
                let to = field(&mut it, s)?;
                let user = field(&mut it, s)?;
                let options = options(&mut it, s)?;
                Command::Exec(ExecRequest { from, to, user, options })
            }
            "SY" => Command::SendReply(Reply::Yes { mode: opt_octal(&mut it, s)? }),
            "RY" => Command::RecvReply(Reply::Yes { mode: opt_octal(&mut it, s)? }),
            "XY" => Command::ExecReply(true),
            "XN" => Command::ExecReply(false),
            "CY" => Command::Confirm(true),
            "H" => Command::Hangup,
            "HY" => Command::HangupYes,
            "HN" => Command::HangupNo,
            _ if head.starts_with("SN") => Command::SendReply(Reply::No { code: code_of(head) }),
            _ if head.starts_with("RN") => Command::RecvReply(Reply::No { code: code_of(head) }),
            _ if head.starts_with("CN") => Command::Confirm(false),
            _ => return Err(bad(s)),
        };
        Ok(cmd)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Send(r) => {
                write!(
                    f,
                    "S {} {} {} -{} {} 0{:o}",
                    r.from, r.to, r.user, r.options, r.temp, r.mode
                )?;
                // an empty notify only appears on the wire when a size
                // has to follow it
                match (r.notify.as_str(), r.size) {
                    ("", Some(n)) => write!(f, " \"\" {}", n),
                    ("", None) => Ok(()),
                    (who, Some(n)) => write!(f, " {} {}", who, n),
                    (who, None) => write!(f, " {}", who),
                }
            }
            Command::Recv(r) => {
                write!(f, "R {} {} {} -{}", r.from, r.to, r.user, r.options)?;
                match r.size {
                    Some(n) => write!(f, " {}", n),
                    None => Ok(()),
                }
            }
            Command::Exec(r) => {
                write!(f, "X {} {} {} -{}", r.from, r.to, r.user, r.options)
            }
            Command::SendReply(Reply::Yes { mode }) => write!(f, "SY 0{:o}", mode),
            Command::SendReply(Reply::No { code: 0 }) => write!(f, "SN"),
            Command::SendReply(Reply::No { code }) => write!(f, "SN{}", code),
            Command::RecvReply(Reply::Yes { mode }) => write!(f, "RY 0{:o}", mode),
            Command::RecvReply(Reply::No { code: 0 }) => write!(f, "RN"),
            Command::RecvReply(Reply::No { code }) => write!(f, "RN{}", code),
            Command::ExecReply(true) => write!(f, "XY"),
            Command::ExecReply(false) => write!(f, "XN"),
            Command::Confirm(true) => write!(f, "CY"),
            Command::Confirm(false) => write!(f, "CN5"),
            Command::Hangup => write!(f, "H"),
            Command::HangupYes => write!(f, "HY"),
            Command::HangupNo => write!(f, "HN"),
        }
    }
}

fn bad(s: &str) -> Error {
    Error::BadCommand(s.to_string())
}

fn field(it: &mut SplitWhitespace, s: &str) -> Result<String, Error> {
    it.next().map(str::to_string).ok_or_else(|| bad(s))
}

/// Options are dash-prefixed even when empty.
fn options(it: &mut SplitWhitespace, s: &str) -> Result<String, Error> {
    let tok = it.next().ok_or_else(|| bad(s))?;
    tok.strip_prefix('-').map(str::to_string).ok_or_else(|| bad(s))
}

fn octal(it: &mut SplitWhitespace, s: &str) -> Result<u32, Error> {
    let tok = it.next().ok_or_else(|| bad(s))?;
    u32::from_str_radix(tok, 8).map_err(|_| bad(s))
}

fn opt_octal(it: &mut SplitWhitespace, s: &str) -> Result<u32, Error> {
    match it.next() {
        Some(tok) => u32::from_str_radix(tok, 8).map_err(|_| bad(s)),
        None => Ok(0o666),
    }
}

fn number(tok: &str, s: &str) -> Result<u64, Error> {
    tok.parse().map_err(|_| bad(s))
}

fn code_of(tok: &str) -> u8 {
    tok.as_bytes().get(2).map_or(0, |b| b.wrapping_sub(b'0'))
}

fn unquote(tok: &str) -> String {
    if tok == "\"\"" {
        String::new()
    } else {
        tok.to_string()
    }
}
