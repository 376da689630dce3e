//! Operation tokens for completion correlation.
//!
//! Each submitted operation gets a token (the ring's user data) naming what
//! it was and which descriptor it belongs to, so a completion is dispatched
//! by matching on `OpType` instead of decoding bits.

use slab::Slab;
use std::os::unix::io::RawFd;

/// Type of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Accept on the listening socket.
    Accept,
    /// Receive into the client's buffer.
    Recv { fd: RawFd },
    /// Send the client's buffer.
    Send { fd: RawFd },
}

/// Allocator for operation tokens with O(1) lookup.
pub struct TokenAllocator {
    ops: Slab<OpType>,
}

impl TokenAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Allocate a token for `op`; the value is used as user data.
    pub fn alloc(&mut self, op: OpType) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Release a token, returning the operation it stood for.
    pub fn free(&mut self, token: u64) -> Option<OpType> {
        self.ops.try_remove(token as usize)
    }

    /// Number of operations in flight.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
