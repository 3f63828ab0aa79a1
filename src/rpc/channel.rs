use super::{CallArg, FunctionCallDescriptor, FunctionReturn, Generation, RemoteAddr, SymbolRef, TypeTag};
use crate::comms::{Channel, Tag};
use crate::error::{CapsuleError, CapsuleResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Synchronous request/response RPC channel on top of [`Channel`]
/// (`SPEC_FULL.md` §4.D). The supervisor is always the initiator; every
/// method blocks until the sandboxee helper replies or the channel closes.
pub struct RpcChannel {
    channel: Arc<Channel>,
    generation: Arc<Generation>,
    closed: AtomicBool,
}

impl RpcChannel {
    pub fn new(channel: Channel, generation: Arc<Generation>) -> Self {
        Self {
            channel: Arc::new(channel),
            generation,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn guard(&self) -> CapsuleResult<()> {
        if self.is_closed() {
            return Err(CapsuleError::Unavailable(
                "RPC channel is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Any I/O or protocol error on the underlying channel is fatal for the
    /// session: the channel latches closed and every subsequent call returns
    /// `Unavailable` without touching the wire again (`SPEC_FULL.md` §4.D).
    fn fatal<T>(&self, result: CapsuleResult<T>) -> CapsuleResult<T> {
        if let Err(e) = &result {
            if !self.closed.swap(true, Ordering::SeqCst) {
                tracing::warn!(error = %e, "rpc channel closing after a fatal transport error");
            }
        }
        result
    }

    fn request(&self, tag: Tag, payload: &[u8]) -> CapsuleResult<(u32, Vec<u8>)> {
        self.guard()?;
        let sent = self.channel.send(tag, payload);
        if sent.is_err() {
            return self.fatal(sent.map(|_| (0, Vec::new())));
        }
        self.fatal(self.channel.recv())
    }

    fn expect_return(&self, response: (u32, Vec<u8>)) -> CapsuleResult<Vec<u8>> {
        let (tag, payload) = response;
        if tag != Tag::Return.as_u32() {
            self.closed.store(true, Ordering::SeqCst);
            return Err(CapsuleError::Internal(format!(
                "expected Return frame, got tag {:#x}",
                tag
            )));
        }
        Ok(payload)
    }

    pub fn allocate(&self, size: u64) -> CapsuleResult<RemoteAddr> {
        let response = self.request(Tag::Allocate, &size.to_ne_bytes())?;
        let payload = self.expect_return(response)?;
        let addr = decode_u64(&payload)?;
        Ok(RemoteAddr::new(addr, self.generation.current()))
    }

    pub fn reallocate(&self, addr: RemoteAddr, new_size: u64) -> CapsuleResult<RemoteAddr> {
        self.check_generation(addr)?;
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&addr.addr.to_ne_bytes());
        payload.extend_from_slice(&new_size.to_ne_bytes());
        let response = self.request(Tag::Reallocate, &payload)?;
        let payload = self.expect_return(response)?;
        let new_addr = decode_u64(&payload)?;
        Ok(RemoteAddr::new(new_addr, self.generation.current()))
    }

    pub fn free(&self, addr: RemoteAddr) -> CapsuleResult<()> {
        self.check_generation(addr)?;
        let response = self.request(Tag::Free, &addr.addr.to_ne_bytes())?;
        self.expect_return(response)?;
        Ok(())
    }

    pub fn symbol(&self, name: &str) -> CapsuleResult<RemoteAddr> {
        let response = self.request(Tag::Symbol, name.as_bytes())?;
        let payload = self.expect_return(response)?;
        let addr = decode_u64(&payload)?;
        if addr == 0 {
            return Err(CapsuleError::NotFound(format!("symbol `{}`", name)));
        }
        Ok(RemoteAddr::new(addr, self.generation.current()))
    }

    pub fn strlen(&self, addr: RemoteAddr) -> CapsuleResult<u64> {
        self.check_generation(addr)?;
        let response = self.request(Tag::Strlen, &addr.addr.to_ne_bytes())?;
        let payload = self.expect_return(response)?;
        decode_u64(&payload)
    }

    /// Hint to the sandboxee-side memory sanitizer; no-op at the kernel
    /// level.
    pub fn mark_memory_initialized(&self, addr: RemoteAddr, size: u64) -> CapsuleResult<()> {
        self.check_generation(addr)?;
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&addr.addr.to_ne_bytes());
        payload.extend_from_slice(&size.to_ne_bytes());
        let response = self.request(Tag::MarkInit, &payload)?;
        self.expect_return(response)?;
        Ok(())
    }

    /// Reads `len` bytes of sandboxee memory via a chunked pseudofile
    /// interface would be the fast path on Linux (`/proc/pid/mem`); here the
    /// RPC read is routed through the helper itself so it works identically
    /// whether or not that pseudofile is accessible.
    pub fn read_memory(&self, addr: RemoteAddr, len: u64) -> CapsuleResult<Vec<u8>> {
        self.check_generation(addr)?;
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&addr.addr.to_ne_bytes());
        payload.extend_from_slice(&len.to_ne_bytes());
        let response = self.request(Tag::Call, &encode_read_request(&payload))?;
        self.expect_return(response)
    }

    pub fn write_memory(&self, addr: RemoteAddr, bytes: &[u8]) -> CapsuleResult<()> {
        self.check_generation(addr)?;
        let mut payload = Vec::with_capacity(8 + bytes.len());
        payload.extend_from_slice(&addr.addr.to_ne_bytes());
        payload.extend_from_slice(bytes);
        let response = self.request(Tag::Call, &encode_write_request(&payload))?;
        self.expect_return(response)?;
        Ok(())
    }

    pub fn send_fd_to_sandboxee(&self, fd: std::os::fd::RawFd) -> CapsuleResult<i32> {
        self.guard()?;
        #[cfg(target_os = "linux")]
        {
            let sent = self.channel.send_fd(fd);
            if sent.is_err() {
                self.closed.store(true, Ordering::SeqCst);
            }
            sent?;
            let response = self.fatal(self.channel.recv())?;
            let payload = self.expect_return(response)?;
            let remote_fd = decode_u64(&payload)? as i32;
            Ok(remote_fd)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = fd;
            Err(CapsuleError::Internal(
                "fd passing is only supported on linux".to_string(),
            ))
        }
    }

    pub fn recv_fd_from_sandboxee(&self, remote_fd: i32) -> CapsuleResult<std::os::fd::OwnedFd> {
        self.guard()?;
        #[cfg(target_os = "linux")]
        {
            let sent = self.channel.send(Tag::RecvFd, &remote_fd.to_ne_bytes());
            if sent.is_err() {
                self.closed.store(true, Ordering::SeqCst);
                sent?;
            }
            self.fatal(self.channel.recv_fd())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = remote_fd;
            Err(CapsuleError::Internal(
                "fd passing is only supported on linux".to_string(),
            ))
        }
    }

    pub fn close_fd_in_sandboxee(&self, remote_fd: i32) -> CapsuleResult<()> {
        let response = self.request(Tag::Close, &remote_fd.to_ne_bytes())?;
        self.expect_return(response)?;
        Ok(())
    }

    /// Issues a remote function call. A malformed descriptor (too many
    /// arguments) is caught by [`FunctionCallDescriptor::new`] and returns
    /// `InvalidArgument` without ever touching the channel.
    pub fn call(&self, descriptor: &FunctionCallDescriptor) -> CapsuleResult<FunctionReturn> {
        let payload = encode_call(descriptor);
        let response = self.request(Tag::Call, &payload)?;
        let payload = self.expect_return(response)?;
        decode_function_return(&payload)
    }

    /// Asks the sandboxee helper to `_exit(0)` cleanly.
    pub fn exit(&self) -> CapsuleResult<()> {
        let sent = self.channel.send(Tag::Exit, &[]);
        self.fatal(sent)?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn check_generation(&self, addr: RemoteAddr) -> CapsuleResult<()> {
        if addr.generation != self.generation.current() {
            return Err(CapsuleError::FailedPrecondition(
                "remote address belongs to a session generation that has been invalidated by a restart".to_string(),
            ));
        }
        Ok(())
    }
}

fn decode_u64(bytes: &[u8]) -> CapsuleResult<u64> {
    let arr: [u8; 8] = bytes
        .get(..8)
        .ok_or_else(|| CapsuleError::Internal("short reply decoding u64".to_string()))?
        .try_into()
        .unwrap();
    Ok(u64::from_ne_bytes(arr))
}

fn encode_read_request(inner: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + inner.len());
    out.push(0); // internal sub-opcode: memory read
    out.extend_from_slice(inner);
    out
}

fn encode_write_request(inner: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + inner.len());
    out.push(1); // internal sub-opcode: memory write
    out.extend_from_slice(inner);
    out
}

fn encode_call(descriptor: &FunctionCallDescriptor) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(2); // internal sub-opcode: function call
    match &descriptor.symbol {
        SymbolRef::Name(name) => {
            out.push(0);
            out.extend_from_slice(&(name.len() as u32).to_ne_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        SymbolRef::Addr(addr) => {
            out.push(1);
            out.extend_from_slice(&addr.addr.to_ne_bytes());
        }
    }
    out.push(descriptor.return_type as u8);
    out.push(descriptor.args.len() as u8);
    for arg in &descriptor.args {
        out.push(arg.ty as u8);
        out.extend_from_slice(&arg.value);
    }
    out
}

fn decode_function_return(bytes: &[u8]) -> CapsuleResult<FunctionReturn> {
    if bytes.len() < 9 {
        return Err(CapsuleError::Internal(
            "function return frame too short".to_string(),
        ));
    }
    let ty = TypeTag::from_u8(bytes[0])
        .ok_or_else(|| CapsuleError::Internal("unknown return type tag".to_string()))?;
    let mut value = [0u8; 8];
    value.copy_from_slice(&bytes[1..9]);
    Ok(FunctionReturn { ty, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::Channel;

    fn channel_pair() -> (RpcChannel, Channel) {
        let (a, b) = Channel::pair().unwrap();
        (RpcChannel::new(a, Arc::new(Generation::new())), b)
    }

    #[test]
    fn allocate_round_trips_and_stamps_generation() {
        let (rpc, helper) = channel_pair();
        std::thread::spawn(move || {
            let (_tag, _payload) = helper.recv().unwrap();
            helper.send(Tag::Return, &42u64.to_ne_bytes()).unwrap();
        });
        let addr = rpc.allocate(16).unwrap();
        assert_eq!(addr.addr, 42);
        assert_eq!(addr.generation, 1);
    }

    #[test]
    fn stale_generation_fails_precondition() {
        let (rpc, _helper) = channel_pair();
        let stale = RemoteAddr::new(100, 0);
        let err = rpc.free(stale).unwrap_err();
        assert!(matches!(err, CapsuleError::FailedPrecondition(_)));
    }

    #[test]
    fn io_error_latches_channel_closed() {
        let (rpc, helper) = channel_pair();
        drop(helper);
        let err = rpc.allocate(1).unwrap_err();
        assert!(matches!(err, CapsuleError::Unavailable(_)));
        assert!(rpc.is_closed());
        let err2 = rpc.allocate(1).unwrap_err();
        assert!(matches!(err2, CapsuleError::Unavailable(_)));
    }

    #[test]
    fn unexpected_tag_is_treated_as_protocol_error() {
        let (rpc, helper) = channel_pair();
        std::thread::spawn(move || {
            let (_tag, _payload) = helper.recv().unwrap();
            helper.send(Tag::Call, b"unexpected").unwrap();
        });
        let err = rpc.allocate(1).unwrap_err();
        assert!(matches!(err, CapsuleError::Internal(_)));
    }

    #[test]
    fn call_descriptor_round_trips_int_args() {
        let descriptor = FunctionCallDescriptor::new(
            SymbolRef::Name("sum".to_string()),
            TypeTag::Int,
            vec![CallArg::int(1000), CallArg::int(337)],
        )
        .unwrap();
        let encoded = encode_call(&descriptor);
        // sub-opcode + symbol-kind + 4-byte len + name + return type + argc
        assert_eq!(encoded[0], 2);
        assert_eq!(encoded[1], 0);
    }

    #[test]
    fn too_many_arguments_is_rejected_without_touching_the_channel() {
        let args = vec![CallArg::int(0); super::super::MAX_CALL_ARGS + 1];
        let err = FunctionCallDescriptor::new(SymbolRef::Name("f".to_string()), TypeTag::Void, args)
            .unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidArgument(_)));
    }
}
