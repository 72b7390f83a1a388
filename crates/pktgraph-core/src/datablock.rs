//! Datablocks: declarative per-packet byte regions for offloadable elements.
//!
//! An offloadable element never hands raw packets to a device. It declares,
//! per datablock, which contiguous region of each packet a kernel reads and
//! writes; per batch, the graph gathers those regions into the compute
//! context's staging memory and emits the device-facing records
//! ([`DatablockKernelArg`], [`DatablockBatchInfo`]) a kernel indexes by.
//!
//! Item payloads are packed tightly from a base offset. When every item has
//! the same size the records carry the fixed-size shortcut and the per-item
//! size/offset vectors are omitted; otherwise the vectors are written into
//! staging right after the payload and the batch info points at them.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};

use crate::anno::AnnoSlot;
use crate::batch::PacketBatch;
use crate::compute::StagingRegion;
use crate::error::{Error, Result};
use crate::packet::Packet;

/// Dense process-wide datablock id.
pub type DatablockId = usize;

/// One contiguous per-packet byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Roi {
    /// No bytes on this side.
    None,
    /// The whole packet.
    Whole,
    /// `len` bytes starting at a fixed header offset.
    Fixed {
        /// Byte offset from the start of the packet.
        offset: usize,
        /// Region length in bytes.
        len: usize,
    },
    /// From a fixed header offset to the end of the packet.
    Tail {
        /// Byte offset from the start of the packet.
        offset: usize,
    },
    /// The 8-byte value of an annotation slot (no packet bytes).
    AnnoValue {
        /// Slot whose value becomes the item payload.
        slot: AnnoSlot,
    },
}

impl Roi {
    /// Resolve to `(offset, len)` within `pkt`, or `None` for sides that
    /// carry no packet bytes. A range that does not fit the packet is a
    /// malformed-packet error.
    pub fn resolve(&self, pkt: &Packet) -> Result<Option<(usize, usize)>> {
        match *self {
            Roi::None | Roi::AnnoValue { .. } => Ok(None),
            Roi::Whole => Ok(Some((0, pkt.len()))),
            Roi::Fixed { offset, len } => {
                if offset + len > pkt.len() {
                    return Err(Error::Graph(format!(
                        "roi {}+{} exceeds packet of {} bytes",
                        offset,
                        len,
                        pkt.len()
                    )));
                }
                Ok(Some((offset, len)))
            }
            Roi::Tail { offset } => {
                if offset > pkt.len() {
                    return Err(Error::Graph(format!(
                        "roi tail offset {} exceeds packet of {} bytes",
                        offset,
                        pkt.len()
                    )));
                }
                Ok(Some((offset, pkt.len() - offset)))
            }
        }
    }
}

/// Static declaration of one datablock.
#[derive(Debug, Clone)]
pub struct DatablockDesc {
    /// Registry name, unique per process.
    pub name: &'static str,
    /// Region each kernel invocation reads.
    pub read_roi: Roi,
    /// Region the kernel writes back into the packet.
    pub write_roi: Roi,
}

/// Process-wide datablock registry, built once during orchestration and
/// shared read-only afterwards.
#[derive(Debug, Default)]
pub struct DatablockRegistry {
    descs: Vec<DatablockDesc>,
    by_name: HashMap<&'static str, DatablockId>,
}

impl DatablockRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a datablock; names must be unique.
    pub fn register(&mut self, desc: DatablockDesc) -> Result<DatablockId> {
        if self.by_name.contains_key(desc.name) {
            return Err(Error::Config(format!(
                "datablock '{}' registered twice",
                desc.name
            )));
        }
        let id = self.descs.len();
        self.by_name.insert(desc.name, id);
        self.descs.push(desc);
        Ok(id)
    }

    /// Look up a descriptor by id.
    pub fn get(&self, id: DatablockId) -> Option<&DatablockDesc> {
        self.descs.get(id)
    }

    /// Look up an id by name.
    pub fn id_of(&self, name: &str) -> Option<DatablockId> {
        self.by_name.get(name).copied()
    }

    /// Number of registered datablocks.
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }
}

/// Device-facing per-datablock batch record. Offsets are relative to the
/// task's input staging area; a size/offset vector offset of zero together
/// with a fixed item size means the vectors were omitted.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DatablockBatchInfo {
    /// Base of the packed input items in staging.
    pub buffer_base_in: u64,
    /// Base of the packed output items in the output staging area.
    pub buffer_base_out: u64,
    /// Offset of the `u16` input size vector, 0 when fixed-size.
    pub item_sizes_in: u64,
    /// Offset of the `u16` output size vector, 0 when fixed-size.
    pub item_sizes_out: u64,
    /// Offset of the `u32` input offset vector, 0 when fixed-size.
    pub item_offsets_in: u64,
    /// Offset of the `u32` output offset vector, 0 when fixed-size.
    pub item_offsets_out: u64,
    /// Number of input items.
    pub item_count_in: u32,
    /// Number of output items.
    pub item_count_out: u32,
}

/// Device-facing per-datablock kernel argument header.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DatablockKernelArg {
    /// Total input items across the task.
    pub total_item_count_in: u32,
    /// Total output items across the task.
    pub total_item_count_out: u32,
    /// Fixed input item size, 0 when items vary.
    pub item_size_in: u16,
    /// Fixed output item size, 0 when items vary.
    pub item_size_out: u16,
}

/// Host-side record of one staged item.
#[derive(Debug, Clone, Copy)]
pub struct PreparedItem {
    /// Slot index of the contributing packet within its batch.
    pub pkt_idx: usize,
    /// Input payload offset in staging.
    pub in_off: u32,
    /// Input payload length.
    pub in_len: u16,
    /// Output span offset in the output staging area.
    pub out_off: u32,
    /// Output span length.
    pub out_len: u16,
    /// Packet-relative offset the output span copies back to.
    pub pkt_write_off: u32,
}

/// Host-side snapshot of one prepared datablock, kept with the parked
/// batch for output copy-back.
#[derive(Debug, Clone)]
pub struct PreparedDatablock {
    /// Registry id of the datablock.
    pub id: DatablockId,
    /// Per-item staging spans in batch slot order.
    pub items: Vec<PreparedItem>,
    /// Device-facing batch record.
    pub info: DatablockBatchInfo,
    /// Device-facing argument header.
    pub arg: DatablockKernelArg,
}

/// Gather one datablock of `batch` into staging.
///
/// `indices` selects the participating batch slots (alive packets at the
/// offloadable element's input). Packets whose ROI does not fit are
/// reported in the skip list; the caller kills them. Staging exhaustion is
/// an error and abandons the offload.
pub fn prepare_datablock(
    desc: &DatablockDesc,
    id: DatablockId,
    batch: &PacketBatch,
    indices: &[usize],
    input: &mut StagingRegion,
    output: &mut StagingRegion,
) -> Result<(PreparedDatablock, Vec<usize>)> {
    let mut items: Vec<PreparedItem> = Vec::with_capacity(indices.len());
    let mut skipped = Vec::new();

    let base_in = input.cursor() as u64;
    let base_out = output.cursor() as u64;

    for &idx in indices {
        let Some(pkt) = batch.get(idx) else {
            continue;
        };

        let read = match read_span(&desc.read_roi, pkt) {
            Ok(span) => span,
            Err(_) => {
                skipped.push(idx);
                continue;
            }
        };
        let write = match desc.write_roi.resolve(pkt) {
            Ok(span) => span,
            Err(_) => {
                skipped.push(idx);
                continue;
            }
        };

        let (in_off, in_len) = match read {
            ReadSpan::Bytes(off, len) => {
                let (stage_off, dst) = input.reserve(len)?;
                dst.copy_from_slice(&pkt.data()[off..off + len]);
                (stage_off as u32, len as u16)
            }
            ReadSpan::Anno(value) => {
                let (stage_off, dst) = input.reserve(8)?;
                dst.copy_from_slice(&value.to_le_bytes());
                (stage_off as u32, 8)
            }
            ReadSpan::Empty => (input.cursor() as u32, 0),
        };

        let (out_off, out_len, pkt_write_off) = match write {
            Some((off, len)) => {
                let (stage_off, _) = output.reserve(len)?;
                (stage_off as u32, len as u16, off as u32)
            }
            None => (output.cursor() as u32, 0, 0),
        };

        items.push(PreparedItem {
            pkt_idx: idx,
            in_off,
            in_len,
            out_off,
            out_len,
            pkt_write_off,
        });
    }

    let fixed_in = fixed_size(items.iter().map(|i| i.in_len));
    let fixed_out = fixed_size(items.iter().map(|i| i.out_len));

    // Variable-size case: append the size and offset vectors to staging so
    // the kernel can index items the way the device expects.
    let mut sizes_in_off = 0u64;
    let mut offsets_in_off = 0u64;
    if fixed_in.is_none() {
        sizes_in_off = write_u16_vector(input, items.iter().map(|i| i.in_len))? as u64;
        offsets_in_off = write_u32_vector(input, items.iter().map(|i| i.in_off))? as u64;
    }
    let mut sizes_out_off = 0u64;
    let mut offsets_out_off = 0u64;
    if fixed_out.is_none() {
        sizes_out_off = write_u16_vector(input, items.iter().map(|i| i.out_len))? as u64;
        offsets_out_off = write_u32_vector(input, items.iter().map(|i| i.out_off))? as u64;
    }

    let count = items.len() as u32;
    let info = DatablockBatchInfo {
        buffer_base_in: base_in,
        buffer_base_out: base_out,
        item_sizes_in: sizes_in_off,
        item_sizes_out: sizes_out_off,
        item_offsets_in: offsets_in_off,
        item_offsets_out: offsets_out_off,
        item_count_in: count,
        item_count_out: count,
    };
    let arg = DatablockKernelArg {
        total_item_count_in: count,
        total_item_count_out: count,
        item_size_in: fixed_in.unwrap_or(0),
        item_size_out: fixed_out.unwrap_or(0),
    };

    Ok((
        PreparedDatablock {
            id,
            items,
            info,
            arg,
        },
        skipped,
    ))
}

/// Whether a packet satisfies every region a datablock declares. The
/// graph kills packets that fail before gathering, so items stay aligned
/// across all of an element's datablocks.
pub fn roi_check(desc: &DatablockDesc, pkt: &Packet) -> bool {
    let read_ok = match &desc.read_roi {
        Roi::AnnoValue { slot } => pkt.anno.is_set(*slot),
        other => other.resolve(pkt).is_ok(),
    };
    read_ok && desc.write_roi.resolve(pkt).is_ok()
}

enum ReadSpan {
    Bytes(usize, usize),
    Anno(u64),
    Empty,
}

fn read_span(roi: &Roi, pkt: &Packet) -> Result<ReadSpan> {
    match roi {
        Roi::AnnoValue { slot } => match pkt.anno.get(*slot) {
            Some(v) => Ok(ReadSpan::Anno(v)),
            None => Err(Error::Graph(format!("annotation slot {:?} unset", slot))),
        },
        other => Ok(match other.resolve(pkt)? {
            Some((off, len)) => ReadSpan::Bytes(off, len),
            None => ReadSpan::Empty,
        }),
    }
}

fn fixed_size<I: Iterator<Item = u16>>(mut sizes: I) -> Option<u16> {
    let first = sizes.next()?;
    sizes.all(|s| s == first).then_some(first)
}

fn write_u16_vector<I: Iterator<Item = u16>>(region: &mut StagingRegion, values: I) -> Result<usize> {
    let values: Vec<u16> = values.collect();
    let (off, dst) = region.reserve_aligned(values.len() * 2, 2)?;
    dst.copy_from_slice(bytemuck::cast_slice(&values));
    Ok(off)
}

fn write_u32_vector<I: Iterator<Item = u32>>(region: &mut StagingRegion, values: I) -> Result<usize> {
    let values: Vec<u32> = values.collect();
    let (off, dst) = region.reserve_aligned(values.len() * 4, 4)?;
    dst.copy_from_slice(bytemuck::cast_slice(&values));
    Ok(off)
}
