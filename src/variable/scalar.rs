use super::{AllocatingVariable, Variable};
use crate::error::{CapsuleError, CapsuleResult};
use crate::rpc::RemoteAddr;
use std::marker::PhantomData;

/// Marker trait for the integer-like primitives `IntVar` can wrap, matching
/// the spec's `int_like` variable kind (`SPEC_FULL.md` §3).
pub trait IntLike: Copy {
    const SIZE: usize;
    fn to_ne_bytes_vec(self) -> Vec<u8>;
    fn from_ne_bytes_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_int_like {
    ($($t:ty),+) => {
        $(impl IntLike for $t {
            const SIZE: usize = std::mem::size_of::<$t>();
            fn to_ne_bytes_vec(self) -> Vec<u8> { self.to_ne_bytes().to_vec() }
            fn from_ne_bytes_slice(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                Self::from_ne_bytes(buf)
            }
        })+
    };
}

impl_int_like!(i8, i16, i32, i64, u8, u16, u32, u64);

pub struct IntVar<T: IntLike> {
    value: T,
    remote: Option<(RemoteAddr, bool)>,
}

impl<T: IntLike> IntVar<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            remote: None,
        }
    }

    pub fn get(&self) -> T {
        self.value
    }
}

impl<T: IntLike> Variable for IntVar<T> {
    fn remote_size(&self) -> u64 {
        T::SIZE as u64
    }

    fn remote_addr(&self) -> Option<RemoteAddr> {
        self.remote.map(|(addr, _)| addr)
    }

    fn serialize(&self) -> Vec<u8> {
        self.value.to_ne_bytes_vec()
    }

    fn deserialize(&mut self, bytes: &[u8]) -> CapsuleResult<()> {
        if bytes.len() < T::SIZE {
            return Err(CapsuleError::Internal(
                "short buffer deserializing int_like variable".to_string(),
            ));
        }
        self.value = T::from_ne_bytes_slice(bytes);
        Ok(())
    }

    fn owns_remote(&self) -> bool {
        self.remote.map(|(_, owned)| owned).unwrap_or(false)
    }
}

impl<T: IntLike> AllocatingVariable for IntVar<T> {
    fn set_remote_addr(&mut self, addr: RemoteAddr, owned: bool) {
        self.remote = Some((addr, owned));
    }

    fn clear_remote_addr(&mut self) {
        self.remote = None;
    }
}

macro_rules! float_var {
    ($name:ident, $t:ty) => {
        pub struct $name {
            value: $t,
            remote: Option<(RemoteAddr, bool)>,
        }

        impl $name {
            pub fn new(value: $t) -> Self {
                Self { value, remote: None }
            }

            pub fn get(&self) -> $t {
                self.value
            }
        }

        impl Variable for $name {
            fn remote_size(&self) -> u64 {
                std::mem::size_of::<$t>() as u64
            }

            fn remote_addr(&self) -> Option<RemoteAddr> {
                self.remote.map(|(addr, _)| addr)
            }

            fn serialize(&self) -> Vec<u8> {
                self.value.to_ne_bytes().to_vec()
            }

            fn deserialize(&mut self, bytes: &[u8]) -> CapsuleResult<()> {
                let size = std::mem::size_of::<$t>();
                if bytes.len() < size {
                    return Err(CapsuleError::Internal(
                        "short buffer deserializing float_like variable".to_string(),
                    ));
                }
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..size]);
                self.value = <$t>::from_ne_bytes(buf);
                Ok(())
            }

            fn owns_remote(&self) -> bool {
                self.remote.map(|(_, owned)| owned).unwrap_or(false)
            }
        }

        impl AllocatingVariable for $name {
            fn set_remote_addr(&mut self, addr: RemoteAddr, owned: bool) {
                self.remote = Some((addr, owned));
            }

            fn clear_remote_addr(&mut self) {
                self.remote = None;
            }
        }
    };
}

float_var!(FloatVar32, f32);
float_var!(FloatVar, f64);

/// Generic pointer variable: holds a remote address value (not a buffer of
/// that size) plus the sync direction to apply around a call.
pub struct PtrVar<T> {
    pointee_addr: u64,
    remote: Option<(RemoteAddr, bool)>,
    direction: super::SyncDirection,
    _marker: PhantomData<T>,
}

impl<T> PtrVar<T> {
    pub fn new(direction: super::SyncDirection) -> Self {
        Self {
            pointee_addr: 0,
            remote: None,
            direction,
            _marker: PhantomData,
        }
    }

    pub fn direction(&self) -> super::SyncDirection {
        self.direction
    }

    pub fn pointee_addr(&self) -> u64 {
        self.pointee_addr
    }

    pub fn set_pointee_addr(&mut self, addr: u64) {
        self.pointee_addr = addr;
    }
}

impl<T> Variable for PtrVar<T> {
    fn remote_size(&self) -> u64 {
        8
    }

    fn remote_addr(&self) -> Option<RemoteAddr> {
        self.remote.map(|(addr, _)| addr)
    }

    fn serialize(&self) -> Vec<u8> {
        self.pointee_addr.to_ne_bytes().to_vec()
    }

    fn deserialize(&mut self, bytes: &[u8]) -> CapsuleResult<()> {
        if bytes.len() < 8 {
            return Err(CapsuleError::Internal(
                "short buffer deserializing ptr variable".to_string(),
            ));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        self.pointee_addr = u64::from_ne_bytes(buf);
        Ok(())
    }

    fn owns_remote(&self) -> bool {
        self.remote.map(|(_, owned)| owned).unwrap_or(false)
    }
}

impl<T> AllocatingVariable for PtrVar<T> {
    fn set_remote_addr(&mut self, addr: RemoteAddr, owned: bool) {
        self.remote = Some((addr, owned));
    }

    fn clear_remote_addr(&mut self) {
        self.remote = None;
    }
}

/// Opaque fixed-layout struct, marshaled as a raw byte blob the caller has
/// already packed (mirrors the spec's `struct` kind, which is host-language
/// defined and out of scope for this core to interpret).
pub struct StructVar {
    bytes: Vec<u8>,
    remote: Option<(RemoteAddr, bool)>,
}

impl StructVar {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            remote: None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Variable for StructVar {
    fn remote_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn remote_addr(&self) -> Option<RemoteAddr> {
        self.remote.map(|(addr, _)| addr)
    }

    fn serialize(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    fn deserialize(&mut self, bytes: &[u8]) -> CapsuleResult<()> {
        self.bytes = bytes.to_vec();
        Ok(())
    }

    fn owns_remote(&self) -> bool {
        self.remote.map(|(_, owned)| owned).unwrap_or(false)
    }
}

impl AllocatingVariable for StructVar {
    fn set_remote_addr(&mut self, addr: RemoteAddr, owned: bool) {
        self.remote = Some((addr, owned));
    }

    fn clear_remote_addr(&mut self) {
        self.remote = None;
    }
}

/// Fixed-length array of `T`, stored as packed bytes.
pub struct FixedArrayVar<T: IntLike> {
    values: Vec<T>,
    remote: Option<(RemoteAddr, bool)>,
}

impl<T: IntLike> FixedArrayVar<T> {
    pub fn new(values: Vec<T>) -> Self {
        Self {
            values,
            remote: None,
        }
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }
}

impl<T: IntLike> Variable for FixedArrayVar<T> {
    fn remote_size(&self) -> u64 {
        (self.values.len() * T::SIZE) as u64
    }

    fn remote_addr(&self) -> Option<RemoteAddr> {
        self.remote.map(|(addr, _)| addr)
    }

    fn serialize(&self) -> Vec<u8> {
        self.values
            .iter()
            .flat_map(|v| v.to_ne_bytes_vec())
            .collect()
    }

    fn deserialize(&mut self, bytes: &[u8]) -> CapsuleResult<()> {
        if bytes.len() < self.values.len() * T::SIZE {
            return Err(CapsuleError::Internal(
                "short buffer deserializing fixed_array variable".to_string(),
            ));
        }
        self.values = bytes
            .chunks_exact(T::SIZE)
            .take(self.values.len())
            .map(T::from_ne_bytes_slice)
            .collect();
        Ok(())
    }

    fn owns_remote(&self) -> bool {
        self.remote.map(|(_, owned)| owned).unwrap_or(false)
    }
}

impl<T: IntLike> AllocatingVariable for FixedArrayVar<T> {
    fn set_remote_addr(&mut self, addr: RemoteAddr, owned: bool) {
        self.remote = Some((addr, owned));
    }

    fn clear_remote_addr(&mut self) {
        self.remote = None;
    }
}

/// A header `{len:u64}` followed by a variable-length payload. First syncs
/// the header, then — based on the size read back — resizes the local
/// payload buffer and syncs the payload separately (`SPEC_FULL.md` §4.E).
pub struct LengthValue {
    payload: Vec<u8>,
    remote: Option<(RemoteAddr, bool)>,
    payload_remote: Option<(RemoteAddr, bool)>,
}

impl LengthValue {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            remote: None,
            payload_remote: None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn header_addr(&self) -> Option<RemoteAddr> {
        self.remote.map(|(addr, _)| addr)
    }

    pub fn payload_addr(&self) -> Option<RemoteAddr> {
        self.payload_remote.map(|(addr, _)| addr)
    }

    pub fn set_payload_remote_addr(&mut self, addr: RemoteAddr, owned: bool) {
        self.payload_remote = Some((addr, owned));
    }

    /// Resizes the local buffer to `new_len` bytes, truncating or
    /// zero-extending, ahead of a payload sync.
    pub fn resize_to(&mut self, new_len: usize) {
        self.payload.resize(new_len, 0);
    }
}

impl Variable for LengthValue {
    fn remote_size(&self) -> u64 {
        8
    }

    fn remote_addr(&self) -> Option<RemoteAddr> {
        self.remote.map(|(addr, _)| addr)
    }

    fn serialize(&self) -> Vec<u8> {
        (self.payload.len() as u64).to_ne_bytes().to_vec()
    }

    fn deserialize(&mut self, bytes: &[u8]) -> CapsuleResult<()> {
        if bytes.len() < 8 {
            return Err(CapsuleError::Internal(
                "short buffer deserializing length_value header".to_string(),
            ));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        let len = u64::from_ne_bytes(buf) as usize;
        self.resize_to(len);
        Ok(())
    }

    fn owns_remote(&self) -> bool {
        self.remote.map(|(_, owned)| owned).unwrap_or(false)
    }
}

impl AllocatingVariable for LengthValue {
    fn set_remote_addr(&mut self, addr: RemoteAddr, owned: bool) {
        self.remote = Some((addr, owned));
    }

    fn clear_remote_addr(&mut self) {
        self.remote = None;
    }
}

/// Wraps a [`LengthValue`] whose payload is a wire-encoded message plus a
/// small envelope identifying the message type (`SPEC_FULL.md` §4.E). The
/// envelope is a single `u32` type id the caller assigns; `encode`/`decode`
/// are supplied by the caller so this stays agnostic to any one
/// serialization format.
pub struct ProtoVar {
    type_id: u32,
    inner: LengthValue,
}

impl ProtoVar {
    pub fn new(type_id: u32, encoded_message: Vec<u8>) -> Self {
        let mut envelope = Vec::with_capacity(4 + encoded_message.len());
        envelope.extend_from_slice(&type_id.to_ne_bytes());
        envelope.extend_from_slice(&encoded_message);
        Self {
            type_id,
            inner: LengthValue::new(envelope),
        }
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    /// The wire-encoded message with the envelope stripped off.
    pub fn message_bytes(&self) -> CapsuleResult<&[u8]> {
        self.inner
            .payload()
            .get(4..)
            .ok_or_else(|| CapsuleError::Internal("proto envelope shorter than its header".to_string()))
    }
}

impl Variable for ProtoVar {
    fn remote_size(&self) -> u64 {
        self.inner.remote_size()
    }

    fn remote_addr(&self) -> Option<RemoteAddr> {
        self.inner.remote_addr()
    }

    fn serialize(&self) -> Vec<u8> {
        self.inner.serialize()
    }

    fn deserialize(&mut self, bytes: &[u8]) -> CapsuleResult<()> {
        self.inner.deserialize(bytes)?;
        if self.inner.payload().len() >= 4 {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&self.inner.payload()[..4]);
            self.type_id = u32::from_ne_bytes(buf);
        }
        Ok(())
    }

    fn owns_remote(&self) -> bool {
        self.inner.owns_remote()
    }
}

impl AllocatingVariable for ProtoVar {
    fn set_remote_addr(&mut self, addr: RemoteAddr, owned: bool) {
        self.inner.set_remote_addr(addr, owned);
    }

    fn clear_remote_addr(&mut self) {
        self.inner.clear_remote_addr();
    }
}

/// A file descriptor shared across the sandbox boundary. Allocation is
/// equivalent to sending the local fd through comms and recording the
/// returned remote fd number; destruction closes each side independently
/// according to ownership flags (`SPEC_FULL.md` §4.E).
pub struct FdVar {
    local_fd: Option<std::os::fd::RawFd>,
    remote_fd: Option<i32>,
    owns_local: bool,
    owns_remote_fd: bool,
}

impl FdVar {
    pub fn from_local(fd: std::os::fd::RawFd, owns_local: bool) -> Self {
        Self {
            local_fd: Some(fd),
            remote_fd: None,
            owns_local,
            owns_remote_fd: false,
        }
    }

    pub fn remote_fd(&self) -> Option<i32> {
        self.remote_fd
    }

    pub fn set_remote_fd(&mut self, remote_fd: i32, owns_remote_fd: bool) {
        self.remote_fd = Some(remote_fd);
        self.owns_remote_fd = owns_remote_fd;
    }

    pub fn owns_remote(&self) -> bool {
        self.owns_remote_fd
    }

    pub fn local_fd(&self) -> Option<std::os::fd::RawFd> {
        self.local_fd
    }

    pub fn disown_remote(&mut self) {
        self.owns_remote_fd = false;
    }
}
