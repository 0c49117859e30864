use std::io;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::err::Error;

/// A full-duplex byte stream with bounded waits.
///
/// The link layer never wants to block on a write while unread bytes pile
/// up on the line, hence the combined transact: sending always drains.
pub trait Port {
    /// Write all of `send`, picking up any inbound bytes into `recv` along
    /// the way. Returns how many bytes were read.
    fn transact(&mut self, send: &[u8], recv: &mut [u8], timeout: Duration)
        -> Result<usize, Error>;

    /// Wait up to `timeout` for inbound bytes. Returns 0 when the wait
    /// elapses with nothing to read.
    fn read(&mut self, recv: &mut [u8], timeout: Duration) -> Result<usize, Error>;
}

/// [`Port`] over any raw descriptor: a serial line, a pty, a socket.
#[derive(Debug)]
pub struct FdPort<T> {
    inner: T,
}

impl<T: AsRawFd> FdPort<T> {
    pub fn new(inner: T) -> FdPort<T> {
        FdPort { inner }
    }

    fn wait_ready(&self, flags: PollFlags, timeout: Duration) -> Result<PollFlags, Error> {
        let mut pfd = [PollFd::new(self.inner.as_raw_fd(), flags)];
        let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        if poll(&mut pfd, ms).map_err(io_err)? == 0 {
            return Ok(PollFlags::empty());
        }
        Ok(pfd[0].revents().unwrap_or_else(PollFlags::empty))
    }
}

fn io_err(e: Errno) -> Error {
    Error::Port(io::Error::from_raw_os_error(e as i32))
}

impl<T: AsRawFd> Port for FdPort<T> {
    fn transact(
        &mut self,
        send: &[u8],
        recv: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        let fd = self.inner.as_raw_fd();
        let deadline = Instant::now() + timeout;
        let mut sent = 0;
        let mut got = 0;
        while sent < send.len() {
            let left = deadline.saturating_duration_since(Instant::now());
            let ready = self.wait_ready(PollFlags::POLLIN | PollFlags::POLLOUT, left)?;
            if ready.is_empty() {
                return Err(Error::Port(io::Error::from(io::ErrorKind::TimedOut)));
            }
            if ready.contains(PollFlags::POLLIN) && got < recv.len() {
                match nix::unistd::read(fd, &mut recv[got..]) {
                    Ok(0) => return Err(Error::LinkDown),
                    Ok(n) => got += n,
                    Err(Errno::EAGAIN) => {}
                    Err(e) => return Err(io_err(e)),
                }
            }
            if ready.contains(PollFlags::POLLOUT) {
                match nix::unistd::write(fd, &send[sent..]) {
                    Ok(n) => sent += n,
                    Err(Errno::EAGAIN) => {}
                    Err(e) => return Err(io_err(e)),
                }
            }
            if ready.intersects(PollFlags::POLLERR | PollFlags::POLLHUP)
                && !ready.contains(PollFlags::POLLIN)
            {
                return Err(Error::LinkDown);
            }
        }
        // pick up whatever has already arrived, without waiting
        while got < recv.len() {
            if !self
                .wait_ready(PollFlags::POLLIN, Duration::ZERO)?
                .contains(PollFlags::POLLIN)
            {
                break;
            }
            match nix::unistd::read(fd, &mut recv[got..]) {
                Ok(0) => return Err(Error::LinkDown),
                Ok(n) => got += n,
                Err(Errno::EAGAIN) => break,
                Err(e) => return Err(io_err(e)),
            }
        }
        Ok(got)
    }

    fn read(&mut self, recv: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        if recv.is_empty() {
            return Ok(0);
        }
        let ready = self.wait_ready(PollFlags::POLLIN, timeout)?;
        if !ready.contains(PollFlags::POLLIN) {
            if ready.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                return Err(Error::LinkDown);
            }
            return Ok(0);
        }
        match nix::unistd::read(self.inner.as_raw_fd(), recv) {
            Ok(0) => Err(Error::LinkDown),
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Ok(0),
            Err(e) => Err(io_err(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod mem {
    use std::collections::VecDeque;
    use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
    use std::time::Duration;

    use super::Port;
    use crate::err::Error;

    /// In-memory duplex pair standing in for a serial line.
    pub struct MemPort {
        tx: Sender<Vec<u8>>,
        rx: Receiver<Vec<u8>>,
        pending: VecDeque<u8>,
    }

    pub fn pair() -> (MemPort, MemPort) {
        let (atx, brx) = channel();
        let (btx, arx) = channel();
        (
            MemPort { tx: atx, rx: arx, pending: VecDeque::new() },
            MemPort { tx: btx, rx: brx, pending: VecDeque::new() },
        )
    }

    impl MemPort {
        fn fill(&mut self, recv: &mut [u8]) -> usize {
            let mut n = 0;
            while n < recv.len() {
                match self.pending.pop_front() {
                    Some(b) => {
                        recv[n] = b;
                        n += 1;
                    }
                    None => match self.rx.try_recv() {
                        Ok(chunk) => self.pending.extend(chunk),
                        Err(_) => break,
                    },
                }
            }
            n
        }
    }

    impl Port for MemPort {
        fn transact(
            &mut self,
            send: &[u8],
            recv: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, Error> {
            self.tx.send(send.to_vec()).map_err(|_| Error::LinkDown)?;
            Ok(self.fill(recv))
        }

        fn read(&mut self, recv: &mut [u8], timeout: Duration) -> Result<usize, Error> {
            let n = self.fill(recv);
            if n > 0 {
                return Ok(n);
            }
            match self.rx.recv_timeout(timeout) {
                Ok(chunk) => {
                    self.pending.extend(chunk);
                    Ok(self.fill(recv))
                }
                Err(RecvTimeoutError::Timeout) => Ok(0),
                Err(RecvTimeoutError::Disconnected) => Err(Error::LinkDown),
            }
        }
    }
}
