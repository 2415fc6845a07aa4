//! Completion-based I/O engine.
//!
//! Owns an io_uring submission/completion ring and a kernel-shared group of
//! receive buffers, and drives the event loop. Callers submit operations
//! tagged with an [`Op`]; completions are delivered to a single [`Handler`]
//! which may submit follow-up operations through the [`EngineCtx`] it is
//! handed.
//!
//! Per-descriptor ordering is the caller's job: the engine does not link
//! operations, so the next operation on a descriptor should only be issued
//! from the previous one's completion.

mod buf_ring;
mod kernel;
mod op;

pub use buf_ring::{BufRing, RECV_BGID};
pub use op::{Op, UserData};

use io_uring::squeue::Flags;
use io_uring::{cqueue, opcode, types, IoUring};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// Engine construction failure.
#[derive(Debug)]
pub enum EngineError {
    /// Host kernel predates the ring features this engine relies on.
    SystemOutdated { major: u32, minor: u32 },
    /// Ring creation or the kernel probe failed.
    Setup(io::Error),
    /// Receive buffer group allocation or registration failed.
    BufferRegistration(io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::SystemOutdated { major, minor } => write!(
                f,
                "kernel {major}.{minor} is too old: {}.{} or newer required",
                kernel::MIN_KERNEL.0,
                kernel::MIN_KERNEL.1
            ),
            EngineError::Setup(e) => write!(f, "ring setup: {e}"),
            EngineError::BufferRegistration(e) => write!(f, "buffer registration: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::SystemOutdated { .. } => None,
            EngineError::Setup(e) | EngineError::BufferRegistration(e) => Some(e),
        }
    }
}

/// A single completion, as delivered to the handler.
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    /// Raw result: negative is a negated errno; for accept it is the
    /// accepted descriptor, for recv/read/write a byte count.
    pub res: i32,
    /// Raw CQE flags.
    pub flags: u32,
    /// For receives that consumed a ring buffer, the received bytes.
    /// Valid only for the duration of the handler call; anything retained
    /// past it must be copied.
    pub buffer: Option<&'a [u8]>,
}

/// The engine's sole callback. Errors propagate out of [`Engine::enter`]
/// and terminate the event loop.
pub trait Handler {
    fn on_complete(
        &mut self,
        ctx: &mut EngineCtx<'_>,
        op: Op,
        completion: Completion<'_>,
    ) -> io::Result<()>;
}

/// The I/O engine.
pub struct Engine {
    // Declaration order doubles as drop order: the ring must be released
    // before the buffer group's backing store is freed.
    ring: IoUring,
    buffers: BufRing,
    /// Entries pushed to the submission queue but not yet handed to the
    /// kernel.
    pending: u32,
    /// Reusable CQE drain batch.
    batch: Vec<(u64, i32, u32)>,
}

impl Engine {
    /// Build the ring and register the receive buffer group.
    ///
    /// `sq_entries` bounds in-flight submissions; the receive group has
    /// `buf_entries` slots (a power of two) of `buf_size` bytes each.
    pub fn new(sq_entries: u32, buf_entries: u16, buf_size: usize) -> Result<Self, EngineError> {
        let (major, minor) = kernel::running_kernel().map_err(EngineError::Setup)?;
        if (major, minor) < kernel::MIN_KERNEL {
            return Err(EngineError::SystemOutdated { major, minor });
        }

        let mut builder = IoUring::builder();
        builder.setup_coop_taskrun();
        builder.setup_single_issuer();
        builder.setup_defer_taskrun();
        let ring = builder.build(sq_entries).map_err(EngineError::Setup)?;

        let buffers = BufRing::new(&ring, buf_entries, buf_size, RECV_BGID)
            .map_err(EngineError::BufferRegistration)?;

        trace!(sq_entries, buf_entries, buf_size, "engine initialized");

        Ok(Engine {
            ring,
            buffers,
            pending: 0,
            batch: Vec::with_capacity(sq_entries as usize * 2),
        })
    }

    /// Borrow the submission interface, e.g. to arm the first accept
    /// before entering the loop.
    pub fn ctx(&mut self) -> EngineCtx<'_> {
        EngineCtx {
            ring: &mut self.ring,
            pending: &mut self.pending,
        }
    }

    /// Hand pending submissions to the kernel. With `wait`, block until at
    /// least one completion is available.
    pub fn flush(&mut self, wait: bool) -> io::Result<()> {
        let submitted = if wait {
            self.ring.submitter().submit_and_wait(1)?
        } else {
            self.ring.submit()?
        };
        trace!(submitted, queued = self.pending, "flushed submissions");
        self.pending = self.pending.saturating_sub(submitted as u32);
        Ok(())
    }

    /// Run the event loop until `running` is cleared or the handler errors.
    ///
    /// An interrupted wait (signal delivery) is not an error; the loop
    /// re-checks the flag and continues or returns.
    pub fn enter<H: Handler>(&mut self, handler: &mut H, running: &AtomicBool) -> io::Result<()> {
        while running.load(Ordering::Relaxed) {
            match self.flush(true) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            self.batch.clear();
            {
                let cq = self.ring.completion();
                for cqe in cq {
                    self.batch.push((cqe.user_data(), cqe.result(), cqe.flags()));
                }
            }

            for i in 0..self.batch.len() {
                let (user_data, res, flags) = self.batch[i];
                let bid = cqueue::buffer_select(flags);

                let op = match UserData(user_data).decode() {
                    Some(op) => op,
                    None => {
                        // No context. Recycle a selected buffer anyway so a
                        // stray completion cannot leak a slot.
                        if let Some(bid) = bid {
                            self.buffers.recycle(bid);
                        }
                        continue;
                    }
                };

                let buffer = match (op, bid) {
                    (Op::Recv { .. }, Some(bid)) if res > 0 => {
                        Some(self.buffers.slice(bid, res as usize))
                    }
                    _ => None,
                };

                let mut ctx = EngineCtx {
                    ring: &mut self.ring,
                    pending: &mut self.pending,
                };
                handler.on_complete(&mut ctx, op, Completion { res, flags, buffer })?;

                // The handler has returned; the slot may go back to the
                // kernel.
                if let Some(bid) = bid {
                    self.buffers.recycle(bid);
                }
            }
        }
        Ok(())
    }
}

/// Submission interface, borrowed from the engine.
///
/// All submissions share one contract: any buffer an entry references must
/// stay valid until the operation completes (or, for suppress-on-success
/// operations, until the peer must have consumed it).
pub struct EngineCtx<'a> {
    ring: &'a mut IoUring,
    pending: &'a mut u32,
}

impl EngineCtx<'_> {
    /// Queue a no-op. Its completion is suppressed on success.
    pub fn nop(&mut self) -> io::Result<()> {
        let entry = opcode::Nop::new()
            .build()
            .flags(Flags::SKIP_SUCCESS)
            .user_data(UserData::NONE.raw());
        self.push(entry)
    }

    /// Queue an accept on the listening socket. Exactly one accept should
    /// be outstanding at a time; re-arm from the completion.
    pub fn accept(&mut self, listener: RawFd) -> io::Result<()> {
        let entry = opcode::Accept::new(
            types::Fd(listener),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .build()
        .user_data(UserData::encode(Op::Accept).raw());
        self.push(entry)
    }

    /// Queue a receive on a connection. The kernel selects a buffer from
    /// the ring group; the completion carries the filled slice.
    pub fn recv(&mut self, fd: RawFd, conn: usize) -> io::Result<()> {
        let entry = opcode::Recv::new(types::Fd(fd), std::ptr::null_mut(), 0)
            .buf_group(RECV_BGID)
            .build()
            .flags(Flags::BUFFER_SELECT)
            .user_data(UserData::encode(Op::Recv { conn }).raw());
        self.push(entry)
    }

    /// Queue a read into `buf`. The buffer must outlive the operation.
    pub fn read(
        &mut self,
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
        conn: usize,
    ) -> io::Result<()> {
        let entry = opcode::Read::new(types::Fd(fd), buf, len)
            .offset(offset)
            .build()
            .user_data(UserData::encode(Op::Read { conn }).raw());
        self.push(entry)
    }

    /// Queue a write from `buf`. With a connection attached the completion
    /// is always delivered: the caller sequences its next operation (and
    /// the buffer's reuse) from it. Without one, success is suppressed.
    /// The buffer must outlive the operation.
    pub fn write(
        &mut self,
        fd: RawFd,
        buf: *const u8,
        len: u32,
        offset: u64,
        conn: Option<usize>,
    ) -> io::Result<()> {
        let entry = opcode::Write::new(types::Fd(fd), buf, len)
            .offset(offset)
            .build();
        let entry = match conn {
            Some(conn) => entry.user_data(UserData::encode(Op::Write { conn }).raw()),
            None => entry
                .flags(Flags::SKIP_SUCCESS)
                .user_data(UserData::NONE.raw()),
        };
        self.push(entry)
    }

    /// Queue a close. With a connection attached the completion is always
    /// delivered, since it is the connection's destruction point. Without
    /// one, success is suppressed.
    pub fn close(&mut self, fd: RawFd, conn: Option<usize>) -> io::Result<()> {
        let entry = opcode::Close::new(types::Fd(fd)).build();
        let entry = match conn {
            Some(conn) => entry.user_data(UserData::encode(Op::Close { conn }).raw()),
            None => entry
                .flags(Flags::SKIP_SUCCESS)
                .user_data(UserData::NONE.raw()),
        };
        self.push(entry)
    }

    /// Push an entry, flushing the queue into the kernel and retrying
    /// until a slot is acquired.
    fn push(&mut self, entry: io_uring::squeue::Entry) -> io::Result<()> {
        loop {
            // Safety: referenced buffers outlive the operation per the
            // submission contract above.
            let pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
            if pushed {
                *self.pending += 1;
                return Ok(());
            }
            self.ring.submit()?;
        }
    }
}
