use std::ptr::NonNull;
use std::str::FromStr;

use bitflags::bitflags;

#[cfg(feature = "palcore-serde")]
use serde::{Deserialize, Serialize};

use crate::utils::Handle;
use crate::{PalError, Result};

/// Marker type for allocations owned by a [`MemoryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuAllocation;

/// Reference to one allocation made by a [`MemoryManager`].
pub type GpuMemory = Handle<GpuAllocation>;

/// Maximum number of heaps a single allocation request may list.
pub const MAX_HEAP_PREFERENCES: usize = 4;

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub enum GpuHeap {
    /// Device-local, CPU-visible.
    Local,
    /// Device-local, not CPU-visible.
    #[default]
    Invisible,
    /// System memory, uncached and write-combined.
    GartUswc,
    /// System memory, CPU cached.
    GartCacheable,
}

impl GpuHeap {
    pub fn is_cpu_visible(self) -> bool {
        !matches!(self, GpuHeap::Invisible)
    }
}

impl FromStr for GpuHeap {
    type Err = PalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(GpuHeap::Local),
            "invisible" => Ok(GpuHeap::Invisible),
            "gart-uswc" | "gartuswc" => Ok(GpuHeap::GartUswc),
            "gart-cacheable" | "gartcacheable" => Ok(GpuHeap::GartCacheable),
            _ => Err(PalError::InvalidValue),
        }
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub enum GpuMemPriority {
    Unused,
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub enum VaRange {
    #[default]
    Default,
    DescriptorTable,
    ShadowDescriptorTable,
}

/// Client-visible part of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuMemoryCreateInfo {
    pub size: u64,
    pub alignment: u64,
    pub priority: GpuMemPriority,
    pub va_range: VaRange,
    /// Heaps in order of preference; only the first `heap_count` entries are meaningful.
    pub heaps: [GpuHeap; MAX_HEAP_PREFERENCES],
    pub heap_count: usize,
}

impl GpuMemoryCreateInfo {
    pub fn heaps(&self) -> &[GpuHeap] {
        &self.heaps[..self.heap_count.min(MAX_HEAP_PREFERENCES)]
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GpuMemoryInternalFlags: u32 {
        /// The allocation must never be paged out while it exists.
        const ALWAYS_RESIDENT = 0x1;
        /// The allocation holds shader code.
        const PIPELINE_CODE   = 0x2;
    }
}

/// Driver-internal part of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuMemoryInternalCreateInfo {
    pub flags: GpuMemoryInternalFlags,
}

/// One sub-range of an allocation used by an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuMemSubAllocInfo {
    pub gpu_memory: GpuMemory,
    pub offset: u64,
    pub size: u64,
}

/// Allocator that backs every GPU-visible allocation made by this crate.
///
/// `map` returns the CPU address of the start of the allocation; callers add
/// their own offsets.
pub trait MemoryManager: Send + Sync {
    fn allocate_gpu_mem(
        &self,
        create_info: &GpuMemoryCreateInfo,
        internal_info: &GpuMemoryInternalCreateInfo,
    ) -> Result<(GpuMemory, u64)>;

    fn free_gpu_mem(&self, memory: GpuMemory, offset: u64);

    fn map(&self, memory: GpuMemory) -> Result<NonNull<u8>>;

    fn unmap(&self, memory: GpuMemory) -> Result<()>;

    fn gpu_virt_addr(&self, memory: GpuMemory) -> u64;

    /// Copies `data` into `memory` at `offset`.
    ///
    /// The default goes through a CPU mapping; managers that can reach
    /// invisible heaps another way override it.
    fn upload(&self, memory: GpuMemory, offset: u64, data: &[u8]) -> Result<()> {
        let base = self.map(memory)?;
        // SAFETY: `offset + data.len()` lies inside the allocation the caller
        // requested and the mapping covers all of it.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                base.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        self.unmap(memory)
    }

    /// CPU address that stays valid without a `map` call for as long as the
    /// allocation lives. Only always-resident memory in a CPU-visible heap
    /// can have one; managers without persistent mappings report `None`.
    fn cpu_addr(&self, memory: GpuMemory) -> Option<NonNull<u8>> {
        let _ = memory;
        None
    }

    /// Fence value the paging queue must reach before submitted work may
    /// reference memory made resident so far.
    fn paging_fence(&self) -> u64 {
        0
    }
}

/// A GPU allocation paired with a byte offset into it.
///
/// This is a reference only: the allocation itself belongs to the memory
/// manager and is freed by whoever bound it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundGpuMemory {
    memory: Option<GpuMemory>,
    offset: u64,
}

impl BoundGpuMemory {
    pub fn is_bound(&self) -> bool {
        self.memory.is_some()
    }

    pub fn memory(&self) -> Option<GpuMemory> {
        self.memory
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Rebinds to `memory` at `offset`; `None` unbinds.
    pub fn update(&mut self, memory: Option<GpuMemory>, offset: u64) {
        self.memory = memory;
        self.offset = if memory.is_some() { offset } else { 0 };
    }

    pub fn gpu_virt_addr(&self, mem_mgr: &dyn MemoryManager) -> Option<u64> {
        self.memory
            .map(|memory| mem_mgr.gpu_virt_addr(memory) + self.offset)
    }

    /// Maps the underlying allocation and returns the address of this binding.
    /// Must be paired with [`Self::unmap`].
    pub fn map(&self, mem_mgr: &dyn MemoryManager) -> Result<NonNull<u8>> {
        let memory = self.memory.ok_or(PalError::InvalidPointer)?;
        let base = mem_mgr.map(memory)?;
        // SAFETY: the manager guarantees the mapping covers the whole allocation
        // and `offset` was handed out by it.
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(self.offset as usize)) })
    }

    pub fn unmap(&self, mem_mgr: &dyn MemoryManager) -> Result<()> {
        let memory = self.memory.ok_or(PalError::InvalidPointer)?;
        mem_mgr.unmap(memory)
    }

    /// Persistent CPU address of the bound range, if the manager keeps one.
    pub fn cpu_addr(&self, mem_mgr: &dyn MemoryManager) -> Option<NonNull<u8>> {
        let base = mem_mgr.cpu_addr(self.memory?)?;
        // SAFETY: the address covers the whole allocation and `offset` was
        // handed out by the manager.
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(self.offset as usize)) })
    }
}
