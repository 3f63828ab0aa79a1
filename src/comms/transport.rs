use super::{Tag, HEADER_LEN, MAX_FRAME_LEN};
use crate::error::{CapsuleError, CapsuleResult};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

#[cfg(target_os = "linux")]
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

/// One direction (`Send`/`Recv`) of the framed transport. The socket itself
/// is duplex, but each direction is independently mutex-guarded so a reader
/// and a writer thread can proceed concurrently without stepping on each
/// other's partial reads/writes (`SPEC_FULL.md` §4.C).
pub struct Channel {
    socket: UnixStream,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
    max_frame_len: u32,
}

impl Channel {
    pub fn new(socket: UnixStream) -> Self {
        Self {
            socket,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(socket: UnixStream, max_frame_len: u32) -> Self {
        Self {
            socket,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            max_frame_len: max_frame_len.min(MAX_FRAME_LEN),
        }
    }

    /// Creates a connected pair of channels sharing a `socketpair(2)` socket,
    /// one end for the supervisor and one for the sandboxee-side helper.
    pub fn pair() -> CapsuleResult<(Channel, Channel)> {
        let (a, b) = UnixStream::pair()
            .map_err(|e| CapsuleError::Syscall(format!("socketpair failed: {}", e)))?;
        Ok((Channel::new(a), Channel::new(b)))
    }

    /// Wraps an fd already connected to a peer `Channel`, e.g. one handed to
    /// a freshly forked child via [`super::super::forkserver`]'s fd
    /// remapping. The caller is responsible for `fd` being a valid,
    /// open, connected stream socket it now owns.
    ///
    /// # Safety
    /// `fd` must be a valid, open file descriptor referring to a connected
    /// `AF_UNIX` stream socket not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Channel::new(UnixStream::from_raw_fd(fd))
    }

    pub fn send(&self, tag: Tag, bytes: &[u8]) -> CapsuleResult<()> {
        self.send_raw(tag.as_u32(), bytes)
    }

    /// Like [`Channel::send`] but accepts a raw tag value, for user-reserved
    /// tags (`>= USER_TAG_BASE`) that don't have a [`Tag`] variant.
    pub fn send_raw(&self, tag: u32, bytes: &[u8]) -> CapsuleResult<()> {
        if bytes.len() as u64 > self.max_frame_len as u64 {
            return Err(CapsuleError::Security(format!(
                "frame of {} bytes exceeds maximum of {}",
                bytes.len(),
                self.max_frame_len
            )));
        }
        use std::io::Write;

        let _guard = self.write_lock.lock().unwrap();
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&tag.to_ne_bytes());
        header[4..8].copy_from_slice(&(bytes.len() as u32).to_ne_bytes());

        let mut socket = &self.socket;
        socket
            .write_all(&header)
            .and_then(|_| socket.write_all(bytes))
            .map_err(|e| CapsuleError::Io(e))
    }

    pub fn recv(&self) -> CapsuleResult<(u32, Vec<u8>)> {
        use std::io::Read;

        let _guard = self.read_lock.lock().unwrap();
        let mut header = [0u8; HEADER_LEN];
        let mut socket = &self.socket;
        socket.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                CapsuleError::Unavailable("channel closed by peer".to_string())
            } else {
                CapsuleError::Io(e)
            }
        })?;

        let tag = u32::from_ne_bytes(header[0..4].try_into().unwrap());
        let length = u32::from_ne_bytes(header[4..8].try_into().unwrap());

        if length > self.max_frame_len {
            return Err(CapsuleError::Security(format!(
                "received frame of {} bytes, exceeding maximum of {} — closing channel",
                length, self.max_frame_len
            )));
        }

        let mut payload = vec![0u8; length as usize];
        socket
            .read_exact(&mut payload)
            .map_err(|e| CapsuleError::Io(e))?;

        Ok((tag, payload))
    }

    /// Sends `fd` as ancillary data alongside a zero-length data frame tagged
    /// `SendFd`, matching the spec's "fds accompany a normal frame describing
    /// their intended purpose" contract.
    #[cfg(target_os = "linux")]
    pub fn send_fd(&self, fd: RawFd) -> CapsuleResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let tag_bytes = Tag::SendFd.as_u32().to_ne_bytes();
        let len_bytes = 0u32.to_ne_bytes();
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&tag_bytes);
        header[4..8].copy_from_slice(&len_bytes);

        let iov = [IoSlice::new(&header)];
        let fds = [fd];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        sendmsg::<()>(self.socket.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
            .map_err(|e| CapsuleError::Syscall(format!("sendmsg failed: {}", e)))?;
        Ok(())
    }

    /// Receives a single fd sent via [`Channel::send_fd`]. The duplicated fd
    /// has close-on-exec set, matching the spec's receiver-side contract.
    #[cfg(target_os = "linux")]
    pub fn recv_fd(&self) -> CapsuleResult<OwnedFd> {
        let _guard = self.read_lock.lock().unwrap();
        let mut header = [0u8; HEADER_LEN];
        let mut iov = [IoSliceMut::new(&mut header)];
        let mut cmsg_buf = nix::cmsg_space!(RawFd);

        let msg = recvmsg::<()>(
            self.socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(|e| CapsuleError::Syscall(format!("recvmsg failed: {}", e)))?;

        if msg.bytes == 0 {
            return Err(CapsuleError::Unavailable(
                "channel closed while awaiting fd".to_string(),
            ));
        }

        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&raw) = fds.first() {
                    set_cloexec(raw)?;
                    // SAFETY: `raw` was just handed to us by the kernel via
                    // SCM_RIGHTS and is not owned elsewhere yet.
                    return Ok(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }

        Err(CapsuleError::Syscall(
            "recvmsg carried no file descriptor".to_string(),
        ))
    }

    /// Like [`Channel::recv`] but also captures an ancillary fd if the
    /// sender attached one via [`Channel::send_fd`] — a single `recvmsg`
    /// covers both the header and the control message, then the payload (if
    /// any) is read normally. Used where a frame's tag alone (`SendFd` vs
    /// anything else) decides whether a descriptor is expected, so the
    /// caller doesn't need two different receive paths on the same socket.
    #[cfg(target_os = "linux")]
    pub fn recv_with_fd(&self) -> CapsuleResult<(u32, Vec<u8>, Option<OwnedFd>)> {
        use std::io::Read;

        let _guard = self.read_lock.lock().unwrap();
        let mut header = [0u8; HEADER_LEN];
        let mut iov = [IoSliceMut::new(&mut header)];
        let mut cmsg_buf = nix::cmsg_space!(RawFd);

        let msg = recvmsg::<()>(
            self.socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::empty(),
        )
        .map_err(|e| CapsuleError::Syscall(format!("recvmsg failed: {}", e)))?;

        if msg.bytes == 0 {
            return Err(CapsuleError::Unavailable("channel closed by peer".to_string()));
        }

        let mut fd = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&raw) = fds.first() {
                    set_cloexec(raw)?;
                    // SAFETY: `raw` was just handed to us by the kernel via
                    // SCM_RIGHTS and is not owned elsewhere yet.
                    fd = Some(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }

        let tag = u32::from_ne_bytes(header[0..4].try_into().unwrap());
        let length = u32::from_ne_bytes(header[4..8].try_into().unwrap());

        if length > self.max_frame_len {
            return Err(CapsuleError::Security(format!(
                "received frame of {} bytes, exceeding maximum of {} — closing channel",
                length, self.max_frame_len
            )));
        }

        let mut payload = vec![0u8; length as usize];
        if length > 0 {
            let mut socket = &self.socket;
            socket.read_exact(&mut payload).map_err(CapsuleError::Io)?;
        }

        Ok((tag, payload, fd))
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn try_clone(&self) -> CapsuleResult<Channel> {
        let cloned = self
            .socket
            .try_clone()
            .map_err(|e| CapsuleError::Io(e))?;
        Ok(Channel {
            socket: cloned,
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            max_frame_len: self.max_frame_len,
        })
    }
}

#[cfg(target_os = "linux")]
fn set_cloexec(fd: RawFd) -> CapsuleResult<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| CapsuleError::Syscall(format!("fcntl(F_SETFD) failed: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_recv_roundtrips_payload() {
        let (a, b) = Channel::pair().unwrap();
        a.send(Tag::Allocate, b"hello").unwrap();
        let (tag, payload) = b.recv().unwrap();
        assert_eq!(tag, Tag::Allocate.as_u32());
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn oversized_frame_is_rejected_before_sending() {
        let (socket, _peer) = UnixStream::pair().unwrap();
        let channel = Channel::with_max_frame_len(socket, 4);
        let err = channel.send(Tag::Call, b"12345").unwrap_err();
        assert!(matches!(err, CapsuleError::Security(_)));
    }

    #[test]
    fn closed_peer_yields_unavailable() {
        let (a, b) = Channel::pair().unwrap();
        drop(b);
        let err = a.recv().unwrap_err();
        assert!(matches!(err, CapsuleError::Unavailable(_)));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn fd_passing_roundtrips_an_open_file() {
        use std::io::Write as _;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"payload").unwrap();

        let (a, b) = Channel::pair().unwrap();
        let file = std::fs::File::open(tmp.path()).unwrap();
        a.send_fd(file.as_raw_fd()).unwrap();

        let received = b.recv_fd().unwrap();
        let mut reopened = std::fs::File::from(received);
        let mut buf = String::new();
        use std::io::Read as _;
        reopened.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "payload");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn recv_with_fd_captures_both_header_and_descriptor() {
        let (a, b) = Channel::pair().unwrap();
        a.send_fd(a.raw_fd()).unwrap();

        let (tag, payload, fd) = b.recv_with_fd().unwrap();
        assert_eq!(tag, Tag::SendFd.as_u32());
        assert!(payload.is_empty());
        assert!(fd.is_some());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn recv_with_fd_reads_a_plain_frame_without_one() {
        let (a, b) = Channel::pair().unwrap();
        a.send(Tag::Call, b"no fd here").unwrap();

        let (tag, payload, fd) = b.recv_with_fd().unwrap();
        assert_eq!(tag, Tag::Call.as_u32());
        assert_eq!(payload, b"no fd here");
        assert!(fd.is_none());
    }
}
