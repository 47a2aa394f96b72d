//! Pseudo-terminal plumbing for the virtual command

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

use rustix::pty::{grantpt, openpt, ptsname, unlockpt, OpenptFlags};
use rustix::termios::{self, LocalModes, OptionalActions, Winsize};

/// An open pseudo-terminal pair.
///
/// The slave end becomes the child's stdin/stdout/stderr and controlling
/// terminal; the master end is pumped by the command's I/O tasks.
pub struct PtyPair {
    /// Master end, held by the server
    pub master: OwnedFd,
    /// Slave end, handed to the child
    pub slave: OwnedFd,
}

impl PtyPair {
    /// Open a fresh pty/tty pair
    pub fn open() -> io::Result<Self> {
        let master = openpt(OpenptFlags::RDWR | OpenptFlags::NOCTTY)?;
        grantpt(&master)?;
        unlockpt(&master)?;

        let slave_name = ptsname(&master, Vec::new())?;
        let slave = rustix::fs::open(
            slave_name.as_c_str(),
            rustix::fs::OFlags::RDWR | rustix::fs::OFlags::NOCTTY,
            rustix::fs::Mode::empty(),
        )?;

        Ok(Self { master, slave })
    }
}

/// Turn off echo on the slave so input written to the master does not come
/// back in the output stream.
pub fn disable_echo(fd: BorrowedFd) -> io::Result<()> {
    let mut attrs = termios::tcgetattr(fd)?;
    attrs.local_modes.remove(LocalModes::ECHO);
    termios::tcsetattr(fd, OptionalActions::Now, &attrs)?;
    Ok(())
}

/// Set the terminal window size on the master
pub fn set_winsize(fd: BorrowedFd, rows: u16, cols: u16) -> io::Result<()> {
    termios::tcsetwinsize(
        fd,
        Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        },
    )?;
    Ok(())
}

/// Read the terminal window size from the master
pub fn get_winsize(fd: BorrowedFd) -> io::Result<(u16, u16)> {
    let ws = termios::tcgetwinsize(fd)?;
    Ok((ws.ws_row, ws.ws_col))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn opens_a_pair_and_sets_winsize() {
        let pair = PtyPair::open().unwrap();

        set_winsize(pair.master.as_fd(), 64, 200).unwrap();
        assert_eq!(get_winsize(pair.master.as_fd()).unwrap(), (64, 200));
        // The slave sees the same size.
        assert_eq!(get_winsize(pair.slave.as_fd()).unwrap(), (64, 200));
    }

    #[test]
    fn echo_can_be_disabled_on_the_slave() {
        let pair = PtyPair::open().unwrap();
        disable_echo(pair.slave.as_fd()).unwrap();

        let attrs = termios::tcgetattr(pair.slave.as_fd()).unwrap();
        assert!(!attrs.local_modes.contains(LocalModes::ECHO));
    }
}
