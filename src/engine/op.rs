//! Operation tagging for completion correlation.
//!
//! Each submitted operation carries its identity in the CQE `user_data`
//! word: a type tag plus the owning connection id, packed into a `u64`.
//! This replaces per-operation allocation entirely; suppress-on-success
//! operations would otherwise leak tracking state, since their success
//! never produces a completion to free it.
//!
//! `user_data == 0` means "no context": the completion is dropped by the
//! event loop. Fire-and-forget nop/write/close submissions use it.

/// An in-flight operation, as recovered from a completion.
///
/// Nops are always fire-and-forget and so have no variant here: they are
/// submitted without a context and their completions, when any, are
/// dropped by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Accept on the listening socket. `res` is the accepted descriptor.
    Accept,
    /// Receive on a connection, buffer selected by the kernel from group 0.
    Recv { conn: usize },
    /// Read into a caller-provided buffer.
    Read { conn: usize },
    /// Write from a caller-provided buffer. Completion delivered when a
    /// connection is attached; suppressed on success otherwise.
    Write { conn: usize },
    /// Close a descriptor. Completion delivered when a connection is
    /// attached; suppressed on success otherwise.
    Close { conn: usize },
}

const TAG_ACCEPT: u64 = 1;
const TAG_RECV: u64 = 2;
const TAG_READ: u64 = 3;
const TAG_WRITE: u64 = 4;
const TAG_CLOSE: u64 = 5;

/// Packed CQE `user_data`: tag in bits 32..40, connection id in bits 0..32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData(pub u64);

impl UserData {
    /// The no-context value. The kernel echoes it back verbatim and the
    /// event loop discards the completion.
    pub const NONE: UserData = UserData(0);

    pub fn encode(op: Op) -> UserData {
        let (tag, conn) = match op {
            Op::Accept => (TAG_ACCEPT, 0),
            Op::Recv { conn } => (TAG_RECV, conn),
            Op::Read { conn } => (TAG_READ, conn),
            Op::Write { conn } => (TAG_WRITE, conn),
            Op::Close { conn } => (TAG_CLOSE, conn),
        };
        debug_assert!(conn < u32::MAX as usize, "connection id exceeds 32 bits");
        UserData(tag << 32 | conn as u64)
    }

    pub fn decode(self) -> Option<Op> {
        let conn = (self.0 & 0xffff_ffff) as usize;
        match self.0 >> 32 {
            TAG_ACCEPT => Some(Op::Accept),
            TAG_RECV => Some(Op::Recv { conn }),
            TAG_READ => Some(Op::Read { conn }),
            TAG_WRITE => Some(Op::Write { conn }),
            TAG_CLOSE => Some(Op::Close { conn }),
            _ => None,
        }
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}
