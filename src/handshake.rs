//! One-shot pipe rendezvous between a parent and a forked child.
//!
//! A [`HandshakeChannel`] carries exactly one "you may proceed" byte. A
//! [`SetupResultChannel`] carries exactly one success/failure byte describing
//! whether the child managed to isolate itself. Both own the two pipe ends and
//! close each end at most once; after a channel has been used it refuses any
//! further traffic.

use nix::errno::Errno;
use nix::unistd::pipe;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::OwnedFd;
use thiserror::Error;
use tracing::debug;

/// Byte written by [`HandshakeChannel::notify`].
pub const SENTINEL: u8 = b'A';

const SETUP_OK: u8 = b'1';
const SETUP_FAILED: u8 = b'0';

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to create pipe: {0}")]
    Create(#[source] Errno),
    #[error("channel has already been used")]
    Consumed,
    #[error("peer closed the pipe without sending anything")]
    Closed,
    #[error("unexpected byte {0:#04x} on channel")]
    UnexpectedByte(u8),
    #[error("more than one byte received on a one-shot channel")]
    Duplicate,
    #[error("pipe i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The two ends of a pipe, each `None` once closed.
#[derive(Debug)]
struct PipeEnds {
    read: Option<File>,
    write: Option<File>,
    used: bool,
}

impl PipeEnds {
    fn new() -> Result<Self, HandshakeError> {
        let (read, write): (OwnedFd, OwnedFd) = pipe().map_err(HandshakeError::Create)?;
        Ok(Self {
            read: Some(File::from(read)),
            write: Some(File::from(write)),
            used: false,
        })
    }

    fn claim(&mut self) -> Result<(), HandshakeError> {
        if self.used {
            return Err(HandshakeError::Consumed);
        }
        self.used = true;
        Ok(())
    }

    fn send(&mut self, byte: u8) -> Result<(), HandshakeError> {
        self.claim()?;
        self.read = None;
        let mut writer = self.write.take().ok_or(HandshakeError::Closed)?;
        writer.write_all(&[byte])?;
        Ok(())
    }

    /// Reads the single byte. A second byte in the same read is a violation.
    fn receive(&mut self) -> Result<u8, HandshakeError> {
        self.claim()?;
        self.write = None;
        let mut reader = self.read.take().ok_or(HandshakeError::Closed)?;
        let mut buf = [0u8; 2];
        let n = loop {
            match reader.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        match n {
            0 => Err(HandshakeError::Closed),
            1 => Ok(buf[0]),
            _ => Err(HandshakeError::Duplicate),
        }
    }

    fn close(&mut self) {
        self.used = true;
        self.read = None;
        self.write = None;
    }
}

/// Single-byte ordering primitive between two processes.
///
/// Create it before forking; afterwards one side calls [`wait`](Self::wait)
/// and the other [`notify`](Self::notify). Each process closes the end it
/// does not use as part of that call, so a waiter whose peer exits without
/// notifying sees end-of-file instead of hanging.
#[derive(Debug)]
pub struct HandshakeChannel {
    ends: PipeEnds,
}

impl HandshakeChannel {
    pub fn create() -> Result<Self, HandshakeError> {
        Ok(Self {
            ends: PipeEnds::new()?,
        })
    }

    /// Blocks until the peer notifies. Succeeds only on exactly one
    /// [`SENTINEL`] byte.
    pub fn wait(&mut self) -> Result<(), HandshakeError> {
        let byte = self.ends.receive()?;
        if byte != SENTINEL {
            return Err(HandshakeError::UnexpectedByte(byte));
        }
        debug!("handshake received");
        Ok(())
    }

    pub fn notify(&mut self) -> Result<(), HandshakeError> {
        self.ends.send(SENTINEL)?;
        debug!("handshake sent");
        Ok(())
    }

    pub fn close(&mut self) {
        self.ends.close();
    }

    pub fn is_open(&self) -> bool {
        self.ends.read.is_some() || self.ends.write.is_some()
    }
}

/// Reports whether a child's isolation step succeeded, once, before the
/// parent looks at anything else the child produces.
#[derive(Debug)]
pub struct SetupResultChannel {
    ends: PipeEnds,
}

impl SetupResultChannel {
    pub fn create() -> Result<Self, HandshakeError> {
        Ok(Self {
            ends: PipeEnds::new()?,
        })
    }

    /// Child side.
    pub fn report(&mut self, succeeded: bool) -> Result<(), HandshakeError> {
        self.ends
            .send(if succeeded { SETUP_OK } else { SETUP_FAILED })
    }

    /// Parent side. End-of-file means the child died before reporting.
    pub fn receive(&mut self) -> Result<bool, HandshakeError> {
        match self.ends.receive()? {
            SETUP_OK => Ok(true),
            SETUP_FAILED => Ok(false),
            other => Err(HandshakeError::UnexpectedByte(other)),
        }
    }

    pub fn close(&mut self) {
        self.ends.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::{IsolationRunner, IsolationStrategy, RunOutcome};
    use crate::namespaces::NamespaceSet;
    use std::cell::RefCell;

    fn raw_write(ends: &mut PipeEnds, bytes: &[u8]) {
        ends.write.as_mut().unwrap().write_all(bytes).unwrap();
    }

    #[test]
    fn test_notify_then_wait_in_one_process() {
        // Both ends live in this process, so notify must leave the write end
        // usable long enough to deliver the byte before wait closes it.
        let mut chan = HandshakeChannel::create().unwrap();
        raw_write(&mut chan.ends, &[SENTINEL]);
        assert!(chan.wait().is_ok());
        assert!(!chan.is_open());
    }

    #[test]
    fn test_wait_fails_when_writer_closes_silently() {
        let mut chan = HandshakeChannel::create().unwrap();
        // wait closes our own write end; nobody else holds one.
        assert!(matches!(chan.wait(), Err(HandshakeError::Closed)));
    }

    #[test]
    fn test_wait_rejects_wrong_byte() {
        let mut chan = HandshakeChannel::create().unwrap();
        raw_write(&mut chan.ends, b"B");
        assert!(matches!(chan.wait(), Err(HandshakeError::UnexpectedByte(b'B'))));
    }

    #[test]
    fn test_wait_rejects_duplicate_notification() {
        let mut chan = HandshakeChannel::create().unwrap();
        raw_write(&mut chan.ends, &[SENTINEL, SENTINEL]);
        assert!(matches!(chan.wait(), Err(HandshakeError::Duplicate)));
    }

    #[test]
    fn test_channel_is_single_use() {
        let mut chan = HandshakeChannel::create().unwrap();
        chan.close();
        assert!(matches!(chan.notify(), Err(HandshakeError::Consumed)));
        assert!(matches!(chan.wait(), Err(HandshakeError::Consumed)));
    }

    #[test]
    fn test_handshake_across_fork() {
        let chan = RefCell::new(HandshakeChannel::create().unwrap());
        let runner = IsolationRunner::new();

        let outcome = runner
            .run(
                IsolationStrategy::Plain,
                NamespaceSet::empty(),
                || match chan.borrow_mut().wait() {
                    Ok(()) => 0,
                    Err(_) => 1,
                },
                Some(|child: crate::isolation::ChildProcess| {
                    if chan.borrow_mut().notify().is_err() {
                        return 10;
                    }
                    match child.wait() {
                        Ok(exit) => exit.code().unwrap_or(20),
                        Err(_) => 30,
                    }
                }),
            )
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed(0));
    }

    #[test]
    fn test_setup_result_round_trip() {
        let mut chan = SetupResultChannel::create().unwrap();
        raw_write(&mut chan.ends, &[SETUP_FAILED]);
        assert!(!chan.receive().unwrap());

        let mut chan = SetupResultChannel::create().unwrap();
        raw_write(&mut chan.ends, &[SETUP_OK]);
        assert!(chan.receive().unwrap());
    }

    #[test]
    fn test_setup_result_eof_is_an_error() {
        let mut chan = SetupResultChannel::create().unwrap();
        assert!(matches!(chan.receive(), Err(HandshakeError::Closed)));
    }
}
