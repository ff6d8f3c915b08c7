//! Host-memory backed [`MemoryManager`] for headless use and tests.
//!
//! Every allocation lives in system memory and is permanently "mapped";
//! `map`/`unmap` only track nesting. GPU virtual addresses are handed out by
//! a bump allocator and are never reused.

use std::ptr::NonNull;
use std::sync::Mutex;

use crate::utils::Pool;
use crate::{
    GpuAllocation, GpuHeap, GpuMemory, GpuMemoryCreateInfo, GpuMemoryInternalCreateInfo,
    GpuMemoryInternalFlags, MemoryManager, PalError, Result,
};

const VA_BASE: u64 = 0x1_0000_0000;
const VA_ALIGNMENT: u64 = 256;

struct HostAllocation {
    storage: Box<[u64]>,
    size: u64,
    heap: GpuHeap,
    request: GpuMemoryCreateInfo,
    flags: GpuMemoryInternalFlags,
    gpu_va: u64,
    map_count: u32,
}

#[derive(Default)]
struct NullState {
    next_va: u64,
    alloc_count: usize,
    free_count: usize,
    fail_next_alloc: Option<PalError>,
    fail_next_map: Option<PalError>,
    paging_fence: u64,
}

/// Description of a live allocation, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NullAllocationInfo {
    pub size: u64,
    /// Heap the allocation landed in: the first preference.
    pub heap: GpuHeap,
    /// The request exactly as the caller made it.
    pub request: GpuMemoryCreateInfo,
    pub flags: GpuMemoryInternalFlags,
    pub gpu_va: u64,
}

pub struct NullMemoryManager {
    allocations: Mutex<Pool<HostAllocation>>,
    state: Mutex<NullState>,
    base_offset: u64,
}

impl Default for NullMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NullMemoryManager {
    pub fn new() -> Self {
        Self::with_base_offset(0)
    }

    /// Every allocation is padded by `base_offset` bytes and handed out at
    /// that offset, the way a suballocator returns ranges inside a larger block.
    pub fn with_base_offset(base_offset: u64) -> Self {
        Self {
            allocations: Mutex::new(Pool::default()),
            state: Mutex::new(NullState {
                next_va: VA_BASE,
                ..Default::default()
            }),
            base_offset,
        }
    }

    /// Makes the next `allocate_gpu_mem` call fail with `err`.
    pub fn fail_next_allocation(&self, err: PalError) {
        self.state().fail_next_alloc = Some(err);
    }

    /// Makes the next `map` call fail with `err`.
    pub fn fail_next_map(&self, err: PalError) {
        self.state().fail_next_map = Some(err);
    }

    pub fn set_paging_fence(&self, value: u64) {
        self.state().paging_fence = value;
    }

    pub fn alloc_count(&self) -> usize {
        self.state().alloc_count
    }

    pub fn free_count(&self) -> usize {
        self.state().free_count
    }

    pub fn live_allocations(&self) -> usize {
        self.pool().len()
    }

    pub fn allocation_info(&self, memory: GpuMemory) -> Option<NullAllocationInfo> {
        let pool = self.pool();
        let alloc = pool.get_ref(cast(memory))?;
        Some(NullAllocationInfo {
            size: alloc.size,
            heap: alloc.heap,
            request: alloc.request,
            flags: alloc.flags,
            gpu_va: alloc.gpu_va,
        })
    }

    /// Copies `len` bytes starting at `offset` out of a live allocation.
    pub fn read_bytes(&self, memory: GpuMemory, offset: u64, len: usize) -> Option<Vec<u8>> {
        let pool = self.pool();
        let alloc = pool.get_ref(cast(memory))?;
        let bytes: &[u8] = bytemuck::cast_slice(&alloc.storage);
        let start = offset as usize;
        bytes.get(start..start.checked_add(len)?).map(<[u8]>::to_vec)
    }

    /// Stores `value` at `offset`, standing in for a GPU-side memory write.
    pub fn write_u32(&self, memory: GpuMemory, offset: u64, value: u32) -> Result<()> {
        let mut pool = self.pool();
        let alloc = pool
            .get_mut_ref(cast(memory))
            .ok_or(PalError::StaleHandle)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut alloc.storage);
        let start = offset as usize;
        let dst = start
            .checked_add(4)
            .and_then(|end| bytes.get_mut(start..end))
            .ok_or(PalError::InvalidValue)?;
        dst.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NullState> {
        self.state.lock().expect("null memory manager state lock poisoned")
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, Pool<HostAllocation>> {
        self.allocations
            .lock()
            .expect("null memory manager pool lock poisoned")
    }
}

fn cast(memory: GpuMemory) -> crate::utils::Handle<HostAllocation> {
    crate::utils::Handle::new(memory.slot, memory.generation)
}

fn uncast(handle: crate::utils::Handle<HostAllocation>) -> GpuMemory {
    crate::utils::Handle::<GpuAllocation>::new(handle.slot, handle.generation)
}

impl MemoryManager for NullMemoryManager {
    fn allocate_gpu_mem(
        &self,
        create_info: &GpuMemoryCreateInfo,
        internal_info: &GpuMemoryInternalCreateInfo,
    ) -> Result<(GpuMemory, u64)> {
        if create_info.size == 0 || create_info.heaps().is_empty() {
            return Err(PalError::InvalidValue);
        }
        if create_info.alignment != 0 && !create_info.alignment.is_power_of_two() {
            return Err(PalError::InvalidValue);
        }

        let gpu_va = {
            let mut state = self.state();
            if let Some(err) = state.fail_next_alloc.take() {
                return Err(err);
            }
            let align = create_info.alignment.max(VA_ALIGNMENT);
            let va = (state.next_va + align - 1) & !(align - 1);
            state.next_va = va + self.base_offset + create_info.size;
            state.alloc_count += 1;
            va
        };

        let total = self.base_offset + create_info.size;
        let words = ((total + 7) / 8) as usize;
        let alloc = HostAllocation {
            storage: vec![0xCDCD_CDCD_CDCD_CDCDu64; words].into_boxed_slice(),
            size: create_info.size,
            heap: create_info.heaps()[0],
            request: *create_info,
            flags: internal_info.flags,
            gpu_va,
            map_count: 0,
        };

        let handle = self.pool().insert(alloc).map_err(|_| PalError::OutOfSlots)?;
        log::trace!(
            "null_mm: allocated {} bytes at 0x{:X} ({:?})",
            create_info.size,
            gpu_va,
            create_info.heaps()[0]
        );
        Ok((uncast(handle), self.base_offset))
    }

    fn free_gpu_mem(&self, memory: GpuMemory, offset: u64) {
        debug_assert_eq!(offset, self.base_offset);
        match self.pool().take(cast(memory)) {
            Some(alloc) => {
                debug_assert_eq!(alloc.map_count, 0, "freeing mapped memory");
                self.state().free_count += 1;
                log::trace!("null_mm: freed allocation at 0x{:X}", alloc.gpu_va);
            }
            None => {
                log::error!("null_mm: double free of {:?}", memory);
                debug_assert!(false, "double free of GPU memory");
            }
        }
    }

    fn map(&self, memory: GpuMemory) -> Result<NonNull<u8>> {
        if let Some(err) = self.state().fail_next_map.take() {
            return Err(err);
        }
        let mut pool = self.pool();
        let alloc = pool
            .get_mut_ref(cast(memory))
            .ok_or(PalError::StaleHandle)?;
        if !alloc.heap.is_cpu_visible() {
            return Err(PalError::NotMappable);
        }
        alloc.map_count += 1;
        NonNull::new(alloc.storage.as_mut_ptr().cast::<u8>()).ok_or(PalError::NotMappable)
    }

    fn unmap(&self, memory: GpuMemory) -> Result<()> {
        let mut pool = self.pool();
        let alloc = pool
            .get_mut_ref(cast(memory))
            .ok_or(PalError::StaleHandle)?;
        if alloc.map_count == 0 {
            return Err(PalError::InvalidValue);
        }
        alloc.map_count -= 1;
        Ok(())
    }

    fn gpu_virt_addr(&self, memory: GpuMemory) -> u64 {
        self.pool()
            .get_ref(cast(memory))
            .map(|alloc| alloc.gpu_va)
            .unwrap_or(0)
    }

    /// Host storage never moves, so always-resident CPU-visible memory is
    /// readable at a fixed address.
    fn cpu_addr(&self, memory: GpuMemory) -> Option<NonNull<u8>> {
        let mut pool = self.pool();
        let alloc = pool.get_mut_ref(cast(memory))?;
        if !alloc.heap.is_cpu_visible()
            || !alloc.flags.contains(GpuMemoryInternalFlags::ALWAYS_RESIDENT)
        {
            return None;
        }
        NonNull::new(alloc.storage.as_mut_ptr().cast::<u8>())
    }

    /// Writes straight into host storage, so invisible heaps accept uploads
    /// the way a DMA copy would.
    fn upload(&self, memory: GpuMemory, offset: u64, data: &[u8]) -> Result<()> {
        let mut pool = self.pool();
        let alloc = pool
            .get_mut_ref(cast(memory))
            .ok_or(PalError::StaleHandle)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut alloc.storage);
        let start = offset as usize;
        let dst = start
            .checked_add(data.len())
            .and_then(|end| bytes.get_mut(start..end))
            .ok_or(PalError::InvalidValue)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    fn paging_fence(&self) -> u64 {
        self.state().paging_fence
    }
}
