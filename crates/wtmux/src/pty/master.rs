// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;

struct RawMaster(OwnedFd);

impl AsRawFd for RawMaster {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for RawMaster {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Non-blocking PTY master side registered with the tokio reactor.
pub struct Master {
    fd: AsyncFd<RawMaster>,
}

impl Master {
    /// Take ownership of a master fd, switching it to non-blocking mode.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        rustix::io::ioctl_fionbio(&fd, true)?;
        Ok(Self { fd: AsyncFd::new(RawMaster(fd))? })
    }

    /// Read whatever output is available, waiting until some is.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            if let Ok(result) =
                guard.try_io(|inner| Ok(rustix::io::read(inner.get_ref(), &mut *buf)?))
            {
                return result;
            }
        }
    }

    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let mut guard = self.fd.writable().await?;
            if let Ok(result) =
                guard.try_io(|inner| Ok(rustix::io::write(inner.get_ref(), &data[offset..])?))
            {
                offset += result?;
            }
        }
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let ws =
            rustix::termios::Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };
        rustix::termios::tcsetwinsize(self.fd.get_ref(), ws)?;
        Ok(())
    }
}

/// Whether an I/O error means the slave side is gone.
pub fn is_hangup(e: &io::Error) -> bool {
    e.raw_os_error() == Some(nix::libc::EIO)
}
