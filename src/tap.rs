//! Host TAP interface plumbing for the virtio-net back-end.
//!
//! The TAP fd is opened non-blocking; the RX thread parks in `poll(2)`
//! instead of a blocking read so a dead interface never wedges the fd, and
//! TX behaves like a congested NIC: if the queue stays full past a short
//! wait the frame is dropped.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use thiserror::Error;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

const TUNTAP: ::std::os::raw::c_uint = 84; // ioctl type 'T'
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, ::std::os::raw::c_int);

/// How long TX waits for the interface before dropping a frame.
const TX_POLL_TIMEOUT_MS: i32 = 100;

/// `struct ifreq`: interface name plus the flags member of the union.
#[repr(C)]
struct IfReq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

#[derive(Error, Debug)]
pub enum TapError {
    #[error("tap interface name '{0}' does not fit in IFNAMSIZ")]
    NameTooLong(String),

    #[error("failed to open /dev/net/tun: {0}")]
    Open(#[source] io::Error),

    #[error("TUNSETIFF for '{name}' failed: {source}")]
    CreateInterface {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// An open TAP interface.
pub struct Tap {
    file: File,
}

impl Tap {
    /// Attach to (or create) the named TAP interface, layer 2, no packet
    /// info header.
    pub fn open(name: &str) -> Result<Self, TapError> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(TapError::NameTooLong(name.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")
            .map_err(TapError::Open)?;

        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0; 22],
        };
        ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        // SAFETY: the fd is a freshly opened /dev/net/tun and ifr is the
        // struct TUNSETIFF expects.
        let rc = unsafe { ioctl_with_mut_ref(&file, TUNSETIFF(), &mut ifr) };
        if rc < 0 {
            return Err(TapError::CreateInterface {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        Ok(Self { file })
    }

    /// Block until a frame arrives and read it.
    pub fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            self.wait(libc::POLLIN, -1)?;
            match (&self.file).read(buf) {
                Ok(n) => return Ok(n),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Write one frame, best effort. Returns the bytes written; 0 means
    /// the interface stayed congested and the frame was dropped.
    pub fn write_frame(&self, frame: &[u8]) -> io::Result<usize> {
        if !self.wait(libc::POLLOUT, TX_POLL_TIMEOUT_MS)? {
            return Ok(0);
        }
        match (&self.file).write(frame) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn wait(&self, events: libc::c_short, timeout_ms: i32) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events,
            revents: 0,
        };
        loop {
            // SAFETY: pfd is a valid pollfd for the lifetime of the call.
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc > 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunsetiff_request_number() {
        // _IOW('T', 202, int)
        assert_eq!(TUNSETIFF(), 0x4004_54ca);
    }

    #[test]
    fn test_name_too_long() {
        let name = "x".repeat(libc::IFNAMSIZ);
        assert!(matches!(Tap::open(&name), Err(TapError::NameTooLong(_))));
    }

    #[test]
    fn test_open_requires_privilege() {
        // Creating interfaces needs CAP_NET_ADMIN; only check the error
        // path when we are unprivileged.
        match Tap::open("argon-test0") {
            Ok(_) => {}
            Err(TapError::Open(_)) | Err(TapError::CreateInterface { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
