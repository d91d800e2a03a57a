//! Blocking AF_NETLINK socket and message framing helpers.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

pub const NLMSG_HDRLEN: usize = 16;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;

const RECV_BUF_LEN: usize = 65536;

#[derive(Debug, Error)]
pub enum Error {
    #[error("netlink socket: {0}")]
    Io(#[from] io::Error),
    /// The kernel answered the request with a negative errno.
    #[error("kernel refused request: {0}")]
    Kernel(io::Error),
    #[error("truncated netlink message")]
    Truncated,
}

impl Error {
    pub(crate) fn from_errno(errno: i32) -> Self {
        Error::Kernel(io::Error::from_raw_os_error(errno))
    }

    /// Raw OS errno carried by a kernel refusal, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Kernel(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// One blocking netlink socket, bound to `protocol` and the multicast
/// `groups` bitmask (0 for request/response use).
pub struct NetlinkSocket {
    fd: RawFd,
    seq: AtomicU32,
}

impl NetlinkSocket {
    pub fn open(protocol: libc::c_int, groups: u32) -> Result<Self, Error> {
        // SAFETY: plain syscalls; fd ownership is ours on success.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = groups;

        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err.into());
        }

        Ok(Self {
            fd,
            seq: AtomicU32::new(1),
        })
    }

    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn send(&self, buf: &[u8]) -> Result<(), Error> {
        let rc = unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Receive one datagram; netlink never splits a message across reads.
    /// `MSG_TRUNC` makes the kernel report the full datagram length, so an
    /// oversized message surfaces as [`Error::Truncated`] instead of being
    /// silently cut short.
    pub fn recv(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let rc = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_TRUNC,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error().into());
        }
        take_datagram(buf, rc as usize)
    }

    /// Send a request carrying `NLM_F_ACK` and wait for the kernel's
    /// acknowledgement, surfacing a negative errno as [`Error::Kernel`].
    pub fn request_ack(&self, msg: Vec<u8>) -> Result<(), Error> {
        self.send(&msg)?;

        loop {
            let data = self.recv()?;
            for (header, payload) in Messages::new(&data) {
                match header.kind {
                    NLMSG_ERROR => {
                        if payload.len() < 4 {
                            return Err(Error::Truncated);
                        }
                        let errno =
                            i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
                        if errno != 0 {
                            return Err(Error::from_errno(-errno));
                        }
                        return Ok(());
                    }
                    NLMSG_DONE => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

/// Shrink `buf` to the datagram length the kernel reported. With
/// `MSG_TRUNC` the report is the datagram's real size even when it did not
/// fit the buffer.
fn take_datagram(mut buf: Vec<u8>, reported: usize) -> Result<Vec<u8>, Error> {
    if reported > buf.len() {
        return Err(Error::Truncated);
    }
    buf.truncate(reported);
    Ok(buf)
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Parsed netlink message header.
#[derive(Debug, Clone, Copy)]
pub struct MsgHeader {
    pub len: usize,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
}

/// Iterator over the messages packed into one received datagram, yielding
/// `(header, payload)` pairs. Stops at the first malformed length.
pub struct Messages<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Messages<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for Messages<'a> {
    type Item = (MsgHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + NLMSG_HDRLEN > self.data.len() {
            return None;
        }
        let d = &self.data[self.offset..];
        let len = u32::from_ne_bytes([d[0], d[1], d[2], d[3]]) as usize;
        if len < NLMSG_HDRLEN || self.offset + len > self.data.len() {
            return None;
        }
        let header = MsgHeader {
            len,
            kind: u16::from_ne_bytes([d[4], d[5]]),
            flags: u16::from_ne_bytes([d[6], d[7]]),
            seq: u32::from_ne_bytes([d[8], d[9], d[10], d[11]]),
        };
        let payload = &d[NLMSG_HDRLEN..len];
        self.offset += align4(len);
        Some((header, payload))
    }
}

pub(crate) fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Outgoing netlink message under construction: header, fixed payload
/// struct, then attributes.
pub struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    pub fn new(kind: u16, flags: u16, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_len, patched in finish()
        buf.extend_from_slice(&kind.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // nlmsg_pid
        Self { buf }
    }

    pub fn payload(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn attr(mut self, kind: u16, data: &[u8]) -> Self {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        let len = 4 + data.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(data);
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
        self
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// Walk the attributes packed into `data`, yielding `(type, payload)` with
/// the nested/byte-order flag bits masked off the type.
pub fn attrs(data: &[u8]) -> AttrIter<'_> {
    AttrIter { data, offset: 0 }
}

const NLA_TYPE_MASK: u16 = 0x3fff;

pub struct AttrIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + 4 > self.data.len() {
            return None;
        }
        let d = &self.data[self.offset..];
        let len = u16::from_ne_bytes([d[0], d[1]]) as usize;
        let kind = u16::from_ne_bytes([d[2], d[3]]) & NLA_TYPE_MASK;
        if len < 4 || self.offset + len > self.data.len() {
            return None;
        }
        let payload = &d[4..len];
        self.offset += align4(len);
        Some((kind, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_roundtrip() {
        let msg = MsgBuilder::new(18, NLM_F_REQUEST, 7)
            .payload(&[0u8; 16])
            .attr(3, b"weave\0")
            .finish();

        // Total length patched into the header and 4-aligned attrs.
        let len = u32::from_ne_bytes([msg[0], msg[1], msg[2], msg[3]]) as usize;
        assert_eq!(len, msg.len());
        assert_eq!(len, NLMSG_HDRLEN + 16 + align4(4 + 6));

        let mut messages = Messages::new(&msg);
        let (header, payload) = messages.next().unwrap();
        assert_eq!(header.kind, 18);
        assert_eq!(header.seq, 7);
        assert_eq!(payload.len(), len - NLMSG_HDRLEN);

        let parsed: Vec<_> = attrs(&payload[16..]).collect();
        assert_eq!(parsed, vec![(3u16, &b"weave\0"[..])]);
    }

    #[test]
    fn test_take_datagram_rejects_oversized_report() {
        // Kernel says the datagram was bigger than the receive buffer.
        let buf = vec![0u8; RECV_BUF_LEN];
        assert!(matches!(
            take_datagram(buf, RECV_BUF_LEN + 1),
            Err(Error::Truncated)
        ));

        let data = take_datagram(vec![0u8; RECV_BUF_LEN], 100).unwrap();
        assert_eq!(data.len(), 100);
    }

    #[test]
    fn test_attr_iter_stops_on_garbage() {
        // Length field shorter than an attribute header.
        let data = [2u8, 0, 3, 0, 0, 0, 0, 0];
        assert_eq!(attrs(&data).count(), 0);
    }
}
