//! In-process serial link made of two channel ends.
//!
//! Used to run the device loop and a host client against each other on
//! separate threads without hardware.

use std::{
    collections::VecDeque,
    io,
    sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel},
    time::Duration,
};

use crate::{Result, SimplePoll, SimpleRead, SimpleWrite, err::Error};

pub struct Loopback {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    timeout: Duration,
}

impl Loopback {
    /// Two connected ends; bytes written to one are read from the other.
    pub fn pair(timeout: Duration) -> (Self, Self) {
        let (a_tx, b_rx) = channel();
        let (b_tx, a_rx) = channel();

        (
            Self { tx: a_tx, rx: a_rx, pending: VecDeque::new(), timeout },
            Self { tx: b_tx, rx: b_rx, pending: VecDeque::new(), timeout },
        )
    }

    fn drain(&mut self) {
        while let Ok(chunk) = self.rx.try_recv() {
            self.pending.extend(chunk);
        }
    }
}

impl SimpleRead for Loopback {
    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        while self.pending.len() < buf.len() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::from(io::ErrorKind::TimedOut).into());
                }
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            }
        }

        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(())
    }
}

impl SimpleWrite for Loopback {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.tx.send(buf.to_vec()).map_err(|_| Error::Closed)
    }
}

impl SimplePoll for Loopback {
    fn poll(&mut self) -> bool {
        self.drain();
        !self.pending.is_empty()
    }
}
