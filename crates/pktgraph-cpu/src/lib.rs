//! Emulated compute backend.
//!
//! Runs offload kernels as host functions over the staged datablock
//! buffers. The backend exists for two reasons: tests exercise the full
//! offload path without accelerator hardware, and nodes without a device
//! still get a working coprocessor tier. A real accelerator backend
//! implements the same `ComputeDevice`/`ComputeContext` contract against
//! its driver and slots in without touching the engine.

#![deny(unsafe_op_in_unsafe_fn)]

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use pktgraph_core::compute::{BufferStore, SharedContext};
use pktgraph_core::datablock::{DatablockBatchInfo, DatablockKernelArg, PreparedDatablock};
use pktgraph_core::{
    CompletionStatus, ComputeContext, ComputeDevice, ContextState, DeviceBufferId, DeviceKind,
    Error, KernelArg, KernelLaunch, KernelRef, ResourceParam, Result, StagingRegion,
};

/// Default staging capacity per context, sized for a full batch of
/// MTU-class packets plus the item vectors.
pub const DEFAULT_STAGING_BYTES: usize = 256 * 1024;

struct PendingLaunch {
    kernel: KernelRef,
    res: ResourceParam,
    datablocks: Vec<PreparedDatablock>,
}

/// A compute context executed on the host.
pub struct EmulatedContext {
    state: ContextState,
    input: StagingRegion,
    output: StagingRegion,
    args: Vec<KernelArg>,
    pending: Option<PendingLaunch>,
    buffers: Arc<BufferStore>,
}

impl EmulatedContext {
    fn new(staging_bytes: usize, buffers: Arc<BufferStore>) -> Self {
        Self {
            state: ContextState::Ready,
            input: StagingRegion::new(staging_bytes),
            output: StagingRegion::new(staging_bytes),
            args: Vec::new(),
            pending: None,
            buffers,
        }
    }
}

impl ComputeContext for EmulatedContext {
    fn state(&self) -> ContextState {
        self.state
    }

    fn begin_task(&mut self) -> Result<()> {
        // Preparing is re-enterable: a computation thread that staged a
        // task and then fell back to the CPU path hands the context back
        // without launching.
        if self.state == ContextState::Running {
            return Err(Error::Device("begin_task on a running context".into()));
        }
        self.input.reset();
        self.output.reset();
        self.args.clear();
        self.pending = None;
        self.state = ContextState::Preparing;
        Ok(())
    }

    fn input_region(&mut self) -> &mut StagingRegion {
        &mut self.input
    }

    fn output_region(&mut self) -> &mut StagingRegion {
        &mut self.output
    }

    fn regions(&mut self) -> (&mut StagingRegion, &mut StagingRegion) {
        (&mut self.input, &mut self.output)
    }

    fn push_kernel_arg(&mut self, arg: KernelArg) {
        self.args.push(arg);
    }

    fn enqueue_kernel_launch(
        &mut self,
        kernel: &KernelRef,
        res: ResourceParam,
        datablocks: &[PreparedDatablock],
    ) -> Result<()> {
        if self.state != ContextState::Preparing {
            return Err(Error::Device(format!(
                "enqueue_kernel_launch in state {:?}",
                self.state
            )));
        }
        self.pending = Some(PendingLaunch {
            kernel: kernel.clone(),
            res,
            datablocks: datablocks.to_vec(),
        });
        self.state = ContextState::Running;
        Ok(())
    }

    fn sync(&mut self) -> CompletionStatus {
        let Some(pending) = self.pending.take() else {
            self.state = ContextState::Ready;
            return CompletionStatus::Failed;
        };
        let arg_info: Vec<DatablockKernelArg> =
            pending.datablocks.iter().map(|db| db.arg).collect();
        let batches: Vec<DatablockBatchInfo> =
            pending.datablocks.iter().map(|db| db.info).collect();

        let status = match &pending.kernel {
            KernelRef::Host(func) => {
                let mut launch = KernelLaunch {
                    args: &self.args,
                    arg_info: &arg_info,
                    batches: &batches,
                    res: pending.res,
                    input: self.input.bytes(),
                    output: self.output.bytes_mut(),
                    buffers: &self.buffers,
                };
                match func(&mut launch) {
                    Ok(()) => CompletionStatus::Success,
                    Err(e) => {
                        warn!("emulated kernel failed: {}", e);
                        CompletionStatus::Failed
                    }
                }
            }
            KernelRef::DeviceSymbol(name) => {
                warn!("emulated backend cannot run device symbol '{}'", name);
                CompletionStatus::Failed
            }
        };
        self.state = ContextState::Ready;
        status
    }

    fn output_bytes(&self) -> &[u8] {
        self.output.bytes()
    }
}

/// Host-executed compute device with a fixed context pool.
pub struct EmulatedDevice {
    name: String,
    node_id: usize,
    buffers: Arc<BufferStore>,
    contexts: Vec<SharedContext>,
}

impl EmulatedDevice {
    /// Create a device with `pool_size` contexts of the default staging
    /// capacity.
    pub fn new(node_id: usize, pool_size: usize) -> Self {
        Self::with_staging(node_id, pool_size, DEFAULT_STAGING_BYTES)
    }

    /// Create a device with an explicit per-context staging capacity.
    pub fn with_staging(node_id: usize, pool_size: usize, staging_bytes: usize) -> Self {
        let buffers = Arc::new(BufferStore::new());
        let contexts = (0..pool_size)
            .map(|_| {
                Arc::new(Mutex::new(EmulatedContext::new(
                    staging_bytes,
                    Arc::clone(&buffers),
                ))) as SharedContext
            })
            .collect();
        debug!(node_id, pool_size, "emulated compute device created");
        Self {
            name: format!("emulated@node{}", node_id),
            node_id,
            buffers,
            contexts,
        }
    }

    /// Shared buffer store (host-visible device memory).
    pub fn buffer_store(&self) -> Arc<BufferStore> {
        Arc::clone(&self.buffers)
    }
}

impl ComputeDevice for EmulatedDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Emulated
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn node_id(&self) -> usize {
        self.node_id
    }

    fn alloc_device_buffer(&mut self, size: usize) -> Result<DeviceBufferId> {
        Ok(self.buffers.alloc(size))
    }

    fn write_device_buffer(
        &mut self,
        id: DeviceBufferId,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        self.buffers.write(id, offset, data)
    }

    fn get_available_context(&mut self) -> Option<SharedContext> {
        self.contexts.pop()
    }

    fn available_contexts(&self) -> usize {
        self.contexts.len()
    }
}
