//! Compute device and context contracts.
//!
//! The accelerator driver itself is an external collaborator; this module
//! fixes the contract the runtime programs against: a device owns buffers
//! and a pool of contexts, a context owns the staging memory and command
//! state for exactly one pending task, and kernels are referenced through
//! tagged [`KernelRef`] arms so the coprocessor can dispatch without
//! captured callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::datablock::{DatablockBatchInfo, DatablockKernelArg, PreparedDatablock};
use crate::error::{Error, Result};

/// Supported device families. One per offload arm; the coprocessor
/// dispatches by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Host-executed emulation backend (tests, CPU fallback).
    Emulated,
    /// CUDA-class accelerator (contract reserved; no in-tree driver).
    Cuda,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Emulated => write!(f, "emulated"),
            DeviceKind::Cuda => write!(f, "cuda"),
        }
    }
}

/// Opaque handle to a device-resident buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBufferId(pub u64);

/// One kernel argument pushed before launch.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg {
    /// A device buffer handle (e.g. an element's resident table).
    Buffer(DeviceBufferId),
    /// An immediate scalar.
    Value(u64),
}

/// Signature of a host-executed kernel.
pub type HostKernelFn = fn(&mut KernelLaunch<'_>) -> Result<()>;

/// Kernel reference carried by an offload arm.
#[derive(Clone)]
pub enum KernelRef {
    /// Kernel runs on the host over the staged bytes.
    Host(HostKernelFn),
    /// Named device symbol, resolved by a real accelerator backend.
    DeviceSymbol(&'static str),
}

impl std::fmt::Debug for KernelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelRef::Host(_) => write!(f, "KernelRef::Host"),
            KernelRef::DeviceSymbol(s) => write!(f, "KernelRef::DeviceSymbol({})", s),
        }
    }
}

/// One offload arm: a device kind an element supports, with the kernel and
/// the workgroup geometry it wants there.
#[derive(Debug, Clone)]
pub struct OffloadArm {
    /// Device family this arm targets.
    pub kind: DeviceKind,
    /// Kernel to launch.
    pub kernel: KernelRef,
    /// Desired workgroup size on this device.
    pub workgroup_size: usize,
}

/// Launch geometry for one task.
#[derive(Debug, Clone, Copy)]
pub struct ResourceParam {
    /// Total work items (one per packet).
    pub num_workitems: usize,
    /// Number of workgroups.
    pub num_workgroups: usize,
    /// Threads per workgroup.
    pub workgroup_size: usize,
}

impl ResourceParam {
    /// Geometry covering `items` with the given workgroup size.
    pub fn for_items(items: usize, workgroup_size: usize) -> Self {
        let workgroup_size = workgroup_size.max(1);
        Self {
            num_workitems: items,
            num_workgroups: items.div_ceil(workgroup_size),
            workgroup_size,
        }
    }
}

/// Lifecycle state of a compute context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Idle, ready to accept a task.
    Ready,
    /// Staging memory is being filled by a computation thread.
    Preparing,
    /// A kernel launch is queued or running.
    Running,
}

/// Completion status of a finished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Kernel ran and outputs are valid.
    Success,
    /// Device failure; the batch is abandoned.
    Failed,
}

/// Bump allocator over a fixed staging area.
///
/// Real backends put pinned (page-locked) memory behind this; the emulated
/// backend uses plain host memory, which serves the same contract.
pub struct StagingRegion {
    buf: Vec<u8>,
    cursor: usize,
}

impl StagingRegion {
    /// Allocate a region of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            cursor: 0,
        }
    }

    /// Bytes handed out so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Total capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Reserve `len` bytes; returns the offset and the writable span.
    pub fn reserve(&mut self, len: usize) -> Result<(usize, &mut [u8])> {
        self.reserve_aligned(len, 1)
    }

    /// Reserve with alignment.
    pub fn reserve_aligned(&mut self, len: usize, align: usize) -> Result<(usize, &mut [u8])> {
        let start = self.cursor.next_multiple_of(align.max(1));
        let end = start.checked_add(len).ok_or(Error::AllocationFailed { size: len })?;
        if end > self.buf.len() {
            return Err(Error::AllocationFailed { size: len });
        }
        self.cursor = end;
        Ok((start, &mut self.buf[start..end]))
    }

    /// Whole backing area.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Whole backing area, writable.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Forget all reservations.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Host-visible store of device-resident buffers.
///
/// Buffers are written during element device-init and read by host-executed
/// kernels; a real backend keeps the same handles but resolves them to
/// device pointers instead.
#[derive(Default)]
pub struct BufferStore {
    next: AtomicU64,
    bufs: Mutex<HashMap<DeviceBufferId, Arc<Vec<u8>>>>,
}

impl BufferStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed buffer.
    pub fn alloc(&self, size: usize) -> DeviceBufferId {
        let id = DeviceBufferId(self.next.fetch_add(1, Ordering::Relaxed));
        self.bufs.lock().insert(id, Arc::new(vec![0u8; size]));
        id
    }

    /// Overwrite a span of a buffer.
    pub fn write(&self, id: DeviceBufferId, offset: usize, data: &[u8]) -> Result<()> {
        let mut bufs = self.bufs.lock();
        let buf = bufs
            .get_mut(&id)
            .ok_or_else(|| Error::Device(format!("unknown device buffer {:?}", id)))?;
        if offset + data.len() > buf.len() {
            return Err(Error::Device(format!(
                "write of {} bytes at {} exceeds buffer of {}",
                data.len(),
                offset,
                buf.len()
            )));
        }
        Arc::make_mut(buf)[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read a whole buffer.
    pub fn read_arc(&self, id: DeviceBufferId) -> Option<Arc<Vec<u8>>> {
        self.bufs.lock().get(&id).cloned()
    }
}

/// Everything a host-executed kernel sees at launch.
pub struct KernelLaunch<'a> {
    /// Arguments pushed before launch, element pointer-table first.
    pub args: &'a [KernelArg],
    /// Per-datablock argument headers.
    pub arg_info: &'a [DatablockKernelArg],
    /// Per-datablock batch records.
    pub batches: &'a [DatablockBatchInfo],
    /// Launch geometry.
    pub res: ResourceParam,
    /// Input staging area (read-only to the kernel).
    pub input: &'a [u8],
    /// Output staging area.
    pub output: &'a mut [u8],
    /// Device buffer resolver.
    pub buffers: &'a BufferStore,
}

impl KernelLaunch<'_> {
    /// Item count of a datablock.
    pub fn item_count(&self, db: usize) -> usize {
        self.batches[db].item_count_in as usize
    }

    /// Input span (offset, len) of one item in the input staging area.
    pub fn item_in_span(&self, db: usize, i: usize) -> (usize, usize) {
        let info = &self.batches[db];
        let arg = &self.arg_info[db];
        if arg.item_size_in != 0 {
            let size = arg.item_size_in as usize;
            (info.buffer_base_in as usize + i * size, size)
        } else {
            let off = read_u32(self.input, info.item_offsets_in as usize + 4 * i) as usize;
            let len = read_u16(self.input, info.item_sizes_in as usize + 2 * i) as usize;
            (off, len)
        }
    }

    /// Output span (offset, len) of one item in the output staging area.
    pub fn item_out_span(&self, db: usize, i: usize) -> (usize, usize) {
        let info = &self.batches[db];
        let arg = &self.arg_info[db];
        if arg.item_size_out != 0 {
            let size = arg.item_size_out as usize;
            (info.buffer_base_out as usize + i * size, size)
        } else {
            let off = read_u32(self.input, info.item_offsets_out as usize + 4 * i) as usize;
            let len = read_u16(self.input, info.item_sizes_out as usize + 2 * i) as usize;
            (off, len)
        }
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// A context shared between its owning computation thread and the
/// coprocessor thread; one user at a time by construction.
pub type SharedContext = Arc<Mutex<dyn ComputeContext>>;

/// Per-task command state and staging memory.
pub trait ComputeContext: Send {
    /// Current lifecycle state.
    fn state(&self) -> ContextState;

    /// Reset staging and arguments for a new task.
    fn begin_task(&mut self) -> Result<()>;

    /// Input staging region for datablock gather.
    fn input_region(&mut self) -> &mut StagingRegion;

    /// Output staging region for kernel results.
    fn output_region(&mut self) -> &mut StagingRegion;

    /// Both staging regions at once, for gather passes that fill input
    /// payloads and reserve output spans in one walk.
    fn regions(&mut self) -> (&mut StagingRegion, &mut StagingRegion);

    /// Push one kernel argument.
    fn push_kernel_arg(&mut self, arg: KernelArg);

    /// Queue the kernel launch over the prepared datablocks.
    fn enqueue_kernel_launch(
        &mut self,
        kernel: &KernelRef,
        res: ResourceParam,
        datablocks: &[PreparedDatablock],
    ) -> Result<()>;

    /// Drive the queued launch to completion.
    fn sync(&mut self) -> CompletionStatus;

    /// Output staging bytes after a successful completion.
    fn output_bytes(&self) -> &[u8];
}

/// A compute device owned by one coprocessor thread.
pub trait ComputeDevice: Send {
    /// Device family.
    fn kind(&self) -> DeviceKind;

    /// Human-readable device name.
    fn name(&self) -> &str;

    /// NUMA node the device is attached to.
    fn node_id(&self) -> usize;

    /// Allocate a device-resident buffer.
    fn alloc_device_buffer(&mut self, size: usize) -> Result<DeviceBufferId>;

    /// Copy host bytes into a device buffer.
    fn write_device_buffer(
        &mut self,
        id: DeviceBufferId,
        offset: usize,
        data: &[u8],
    ) -> Result<()>;

    /// Take a ready context from the device pool.
    fn get_available_context(&mut self) -> Option<SharedContext>;

    /// Contexts still available in the pool.
    fn available_contexts(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_reserve_and_reset() {
        let mut region = StagingRegion::new(64);
        let (off, span) = region.reserve(10).unwrap();
        assert_eq!(off, 0);
        assert_eq!(span.len(), 10);
        let (off2, _) = region.reserve_aligned(4, 8).unwrap();
        assert_eq!(off2, 16);
        region.reset();
        assert_eq!(region.cursor(), 0);
    }

    #[test]
    fn test_staging_exhaustion() {
        let mut region = StagingRegion::new(8);
        assert!(region.reserve(16).is_err());
    }

    #[test]
    fn test_buffer_store_roundtrip() {
        let store = BufferStore::new();
        let id = store.alloc(16);
        store.write(id, 4, &[1, 2, 3, 4]).unwrap();
        let buf = store.read_arc(id).unwrap();
        assert_eq!(&buf[4..8], &[1, 2, 3, 4]);
        assert_eq!(&buf[0..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_buffer_store_bounds() {
        let store = BufferStore::new();
        let id = store.alloc(4);
        assert!(store.write(id, 2, &[0; 4]).is_err());
        assert!(store.write(DeviceBufferId(99), 0, &[0]).is_err());
    }

    #[test]
    fn test_resource_param_geometry() {
        let res = ResourceParam::for_items(100, 32);
        assert_eq!(res.num_workitems, 100);
        assert_eq!(res.num_workgroups, 4);
        assert_eq!(res.workgroup_size, 32);
    }
}
