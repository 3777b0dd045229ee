//! The work item: a common header (spec §3) plus one of five op-specific
//! payloads. Callers own the storage (typically a `static` or a stack value
//! that outlives the `Live` window); the kernel only ever sees `NonNull`
//! pointers into it and never allocates or copies a work item.

use core::ptr::NonNull;

use microq_abi::{WorkError, WorkFlags, WorkOp};

use crate::config::{MAX_BLOCK_SEGMENTS, MAX_NET_RECV_BUFFERS, MAX_NET_SEND_BUFFERS};

/// Where a work item currently sits in the lifecycle (spec §3, §4.11).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkState {
    Dead = 0,
    SubmitRequested = 1,
    Live = 2,
    Ready = 3,
    CancelRequested = 4,
}

/// Callback invoked when a work item becomes `Ready` and is drained.
///
/// Receives the item so the callback can read `result` and any op-specific
/// output fields, and may call `submit`/`cancel`/`release_net_buffer` again
/// from inside the callback (those effects land on the *next* tick).
pub type WorkCallback = fn(&mut WorkItem);

/// Fields common to every work item, regardless of op.
pub struct WorkHeader {
    pub op: WorkOp,
    pub state: WorkState,
    pub flags: WorkFlags,
    pub result: WorkError,
    pub callback: Option<WorkCallback>,
    pub ctx: *mut (),
    pub(crate) next: Option<NonNull<WorkItem>>,
    pub(crate) prev: Option<NonNull<WorkItem>>,
}

impl WorkHeader {
    const fn new(op: WorkOp) -> Self {
        Self {
            op,
            state: WorkState::Dead,
            flags: WorkFlags::empty(),
            result: WorkError::Ok,
            callback: None,
            ctx: core::ptr::null_mut(),
            next: None,
            prev: None,
        }
    }

    pub fn is_standing(&self) -> bool {
        self.flags.contains(WorkFlags::STANDING)
    }
}

/// One segment of a block request: a sector range and the buffer backing it.
#[derive(Clone, Copy)]
pub struct BlockSegment {
    pub sector: u64,
    pub buffer: *mut u8,
    pub num_sectors: u32,
    pub completed_sectors: u32,
}

impl BlockSegment {
    pub const fn empty() -> Self {
        Self {
            sector: 0,
            buffer: core::ptr::null_mut(),
            num_sectors: 0,
            completed_sectors: 0,
        }
    }
}

/// One buffer slot of a standing NetRecv ring.
#[derive(Clone, Copy)]
pub struct NetRecvBuffer {
    pub buffer: *mut u8,
    pub capacity: u32,
    pub packet_length: u32,
    /// Descriptor chain head for this slot, set on first post, reused on
    /// every re-arm via `release_net_buffer`.
    pub desc_head: Option<u16>,
}

impl NetRecvBuffer {
    pub const fn empty() -> Self {
        Self {
            buffer: core::ptr::null_mut(),
            capacity: 0,
            packet_length: 0,
            desc_head: None,
        }
    }
}

/// One outgoing packet in a NetSend request.
#[derive(Clone, Copy)]
pub struct NetSendPacket {
    pub buffer: *const u8,
    pub length: u32,
}

impl NetSendPacket {
    pub const fn empty() -> Self {
        Self {
            buffer: core::ptr::null(),
            length: 0,
        }
    }
}

/// Timer-specific fields: the deadline and the heap linkage (spec §4.2).
///
/// `parent`/`left`/`right` are maintained exclusively by `timer_heap` and
/// swapped as whole nodes (not payloads) so an external handle to this timer
/// stays valid across heap mutations (spec §9, Heap link stability).
pub struct TimerData {
    pub deadline_ms: u64,
    pub(crate) parent: Option<NonNull<WorkItem>>,
    pub(crate) left: Option<NonNull<WorkItem>>,
    pub(crate) right: Option<NonNull<WorkItem>>,
}

impl TimerData {
    pub const fn new(deadline_ms: u64) -> Self {
        Self {
            deadline_ms,
            parent: None,
            left: None,
            right: None,
        }
    }
}

pub struct RngData {
    pub buffer: *mut u8,
    pub requested: u32,
    pub completed: u32,
    /// Set/cleared by the owning driver across dispatch/completion; not
    /// touched by the kernel itself.
    pub desc_idx: Option<u16>,
}

impl RngData {
    pub const fn new(buffer: *mut u8, requested: u32) -> Self {
        Self {
            buffer,
            requested,
            completed: 0,
            desc_idx: None,
        }
    }
}

/// Which of the three block operations a `BlockData` request performs (spec
/// §4.9: read, write, flush are distinct ops, not a read/write boolean).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
    Flush,
}

pub struct BlockData {
    pub op: BlockOp,
    pub segments: [BlockSegment; MAX_BLOCK_SEGMENTS],
    pub segment_count: usize,
    /// Set/cleared by the owning driver across dispatch/completion; not
    /// touched by the kernel itself.
    pub desc_idx: Option<u16>,
}

impl BlockData {
    pub const fn new(op: BlockOp) -> Self {
        Self {
            op,
            segments: [BlockSegment::empty(); MAX_BLOCK_SEGMENTS],
            segment_count: 0,
            desc_idx: None,
        }
    }
}

pub struct NetRecvData {
    pub buffers: [NetRecvBuffer; MAX_NET_RECV_BUFFERS],
    pub ring_size: usize,
    pub last_filled: usize,
}

impl NetRecvData {
    pub const fn new(ring_size: usize) -> Self {
        const EMPTY: NetRecvBuffer = NetRecvBuffer::empty();
        Self {
            buffers: [EMPTY; MAX_NET_RECV_BUFFERS],
            ring_size,
            last_filled: 0,
        }
    }
}

pub struct NetSendData {
    pub packets: [NetSendPacket; MAX_NET_SEND_BUFFERS],
    pub packet_count: usize,
    pub sent: usize,
    /// Set/cleared by the owning driver across dispatch/completion; not
    /// touched by the kernel itself.
    pub desc_idx: Option<u16>,
}

impl NetSendData {
    pub const fn new() -> Self {
        const EMPTY: NetSendPacket = NetSendPacket::empty();
        Self {
            packets: [EMPTY; MAX_NET_SEND_BUFFERS],
            packet_count: 0,
            sent: 0,
            desc_idx: None,
        }
    }
}

/// The op-specific half of a work item.
pub enum WorkKind {
    Timer(TimerData),
    Rng(RngData),
    Block(BlockData),
    NetRecv(NetRecvData),
    NetSend(NetSendData),
}

impl WorkKind {
    const fn op(&self) -> WorkOp {
        match self {
            WorkKind::Timer(_) => WorkOp::Timer,
            WorkKind::Rng(_) => WorkOp::RngRead,
            WorkKind::Block(d) => match d.op {
                BlockOp::Read => WorkOp::BlockRead,
                BlockOp::Write => WorkOp::BlockWrite,
                BlockOp::Flush => WorkOp::BlockFlush,
            },
            WorkKind::NetRecv(_) => WorkOp::NetRecv,
            WorkKind::NetSend(_) => WorkOp::NetSend,
        }
    }
}

/// A work item: common header plus an op-specific payload.
///
/// Embed this in caller-owned storage (a `static`, a stack frame that outlives
/// the `Live` window, or an arena slot). The kernel and drivers only ever
/// take `NonNull<WorkItem>` pointers into it.
pub struct WorkItem {
    pub header: WorkHeader,
    pub kind: WorkKind,
}

impl WorkItem {
    pub const fn new(kind: WorkKind) -> Self {
        let op = kind.op();
        Self {
            header: WorkHeader::new(op),
            kind,
        }
    }

    pub fn op(&self) -> WorkOp {
        self.kind.op()
    }

    pub fn as_timer(&mut self) -> Option<&mut TimerData> {
        match &mut self.kind {
            WorkKind::Timer(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_rng(&mut self) -> Option<&mut RngData> {
        match &mut self.kind {
            WorkKind::Rng(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_block(&mut self) -> Option<&mut BlockData> {
        match &mut self.kind {
            WorkKind::Block(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_net_recv(&mut self) -> Option<&mut NetRecvData> {
        match &mut self.kind {
            WorkKind::NetRecv(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_net_send(&mut self) -> Option<&mut NetSendData> {
        match &mut self.kind {
            WorkKind::NetSend(d) => Some(d),
            _ => None,
        }
    }
}
