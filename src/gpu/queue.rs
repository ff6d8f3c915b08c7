//! Per-queue fencing resources and submission shaping.
//!
//! A queue context owns a small always-resident allocation holding the
//! exclusive-exec timestamp (offset 0) and, optionally, the wait-for-idle
//! timestamp (offset 4) in the same allocation. The CPU zeroes it once;
//! afterwards only GPU postambles write it and the CPU only polls it, through
//! the persistent CPU address the memory manager reports for always-resident
//! memory.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::{
    BoundGpuMemory, GpuHeap, GpuMemPriority, GpuMemory, GpuMemoryCreateInfo,
    GpuMemoryInternalCreateInfo, GpuMemoryInternalFlags, MemoryManager, PalError, Result,
    VaRange,
};

const TIMESTAMP_SIZE: u64 = std::mem::size_of::<u32>() as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueContextState {
    /// No timestamp memory has been allocated yet.
    Uninitialized,
    TimestampReady,
}

/// Queue-level submission request.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitInfo<'a> {
    pub cmd_stream_count: u32,
    pub gpu_mem_refs: &'a [GpuMemory],
}

/// How a submission must be wrapped before it reaches the hardware queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InternalSubmitInfo {
    pub num_preamble_cmd_streams: u32,
    pub num_postamble_cmd_streams: u32,
    pub paging_fence: u64,
}

/// Timestamp allocation shared by every queue context kind.
pub struct TimestampMemory {
    mem_mgr: Arc<dyn MemoryManager>,
    exclusive_exec_ts: BoundGpuMemory,
    wait_for_idle_ts: BoundGpuMemory,
    state: QueueContextState,
    /// Persistent CPU address of the exclusive-exec timestamp, when the
    /// manager has one. Polling falls back to a scoped map otherwise.
    cpu_addr: Option<NonNull<u8>>,
}

// SAFETY: `cpu_addr` points into an always-resident allocation owned by this
// object, stays valid until it is freed in `Drop` and is only read.
unsafe impl Send for TimestampMemory {}

impl TimestampMemory {
    pub fn new(mem_mgr: Arc<dyn MemoryManager>) -> Self {
        Self {
            mem_mgr,
            exclusive_exec_ts: BoundGpuMemory::default(),
            wait_for_idle_ts: BoundGpuMemory::default(),
            state: QueueContextState::Uninitialized,
            cpu_addr: None,
        }
    }

    pub fn state(&self) -> QueueContextState {
        self.state
    }

    pub fn exclusive_exec_ts(&self) -> &BoundGpuMemory {
        &self.exclusive_exec_ts
    }

    pub fn wait_for_idle_ts(&self) -> &BoundGpuMemory {
        &self.wait_for_idle_ts
    }

    pub fn memory_manager(&self) -> &Arc<dyn MemoryManager> {
        &self.mem_mgr
    }

    /// Suballocates the timestamps and zeroes them.
    ///
    /// Failures propagate unchanged. Bindings made before the failure are
    /// kept, so after an error the owner must be destroyed, not retried.
    /// Calling this again once memory is bound fails with `Unavailable`.
    pub fn create(&mut self, need_wait_for_idle_mem: bool) -> Result<()> {
        if self.exclusive_exec_ts.is_bound() {
            log::error!("queue: timestamp memory already created");
            return Err(PalError::Unavailable);
        }

        let mut create_info = GpuMemoryCreateInfo {
            alignment: TIMESTAMP_SIZE,
            size: if need_wait_for_idle_mem {
                std::mem::size_of::<u64>() as u64
            } else {
                TIMESTAMP_SIZE
            },
            priority: GpuMemPriority::Normal,
            va_range: VaRange::Default,
            heap_count: 2,
            ..Default::default()
        };
        create_info.heaps[0] = GpuHeap::Local;
        create_info.heaps[1] = GpuHeap::GartUswc;

        let internal_info = GpuMemoryInternalCreateInfo {
            flags: GpuMemoryInternalFlags::ALWAYS_RESIDENT,
        };

        let (memory, offset) = self
            .mem_mgr
            .allocate_gpu_mem(&create_info, &internal_info)?;

        self.exclusive_exec_ts.update(Some(memory), offset);
        if need_wait_for_idle_mem {
            self.wait_for_idle_ts
                .update(Some(memory), offset + TIMESTAMP_SIZE);
        }

        let ptr = self.exclusive_exec_ts.map(self.mem_mgr.as_ref())?;
        // SAFETY: the mapping covers `create_info.size` bytes starting at the
        // binding, and the allocation is at least 4-byte aligned.
        unsafe {
            if need_wait_for_idle_mem {
                ptr.as_ptr().cast::<[u32; 2]>().write_volatile([0, 0]);
            } else {
                ptr.as_ptr().cast::<u32>().write_volatile(0);
            }
        }
        self.exclusive_exec_ts.unmap(self.mem_mgr.as_ref())?;
        self.cpu_addr = self.exclusive_exec_ts.cpu_addr(self.mem_mgr.as_ref());

        self.state = QueueContextState::TimestampReady;
        log::debug!(
            "queue: timestamp memory ready (wait-for-idle: {}, va: 0x{:X})",
            need_wait_for_idle_mem,
            self.exclusive_exec_ts
                .gpu_virt_addr(self.mem_mgr.as_ref())
                .unwrap_or(0)
        );
        Ok(())
    }

    pub fn read_exclusive_exec(&self) -> Result<u32> {
        self.read(&self.exclusive_exec_ts)
    }

    pub fn read_wait_for_idle(&self) -> Result<u32> {
        self.read(&self.wait_for_idle_ts)
    }

    fn read(&self, ts: &BoundGpuMemory) -> Result<u32> {
        if !ts.is_bound() {
            return Err(PalError::Unavailable);
        }
        let Some(base) = self.cpu_addr else {
            let ptr = ts.map(self.mem_mgr.as_ref())?;
            // SAFETY: timestamps are 4-byte aligned and covered by the mapping.
            let value = unsafe { ptr.as_ptr().cast::<u32>().read_volatile() };
            ts.unmap(self.mem_mgr.as_ref())?;
            return Ok(value);
        };
        let delta = ts.offset() - self.exclusive_exec_ts.offset();
        // SAFETY: both timestamps are 4-byte aligned and lie inside the
        // allocation `base` points into.
        Ok(unsafe { base.as_ptr().add(delta as usize).cast::<u32>().read_volatile() })
    }
}

impl Drop for TimestampMemory {
    fn drop(&mut self) {
        self.cpu_addr = None;
        if self.wait_for_idle_ts.is_bound() {
            // Shares the exclusive-exec allocation; nothing to free here.
            self.wait_for_idle_ts.update(None, 0);
            debug_assert!(self.exclusive_exec_ts.is_bound());
        }

        if let Some(memory) = self.exclusive_exec_ts.memory() {
            self.mem_mgr
                .free_gpu_mem(memory, self.exclusive_exec_ts.offset());
            self.exclusive_exec_ts.update(None, 0);
        }
    }
}

/// Behaviour every queue kind provides before a submission.
pub trait QueueContext: Send {
    fn timestamps(&self) -> &TimestampMemory;

    fn state(&self) -> QueueContextState {
        self.timestamps().state()
    }

    /// Describes the preamble, postamble and paging fence `submit_info` needs.
    ///
    /// The default adds nothing.
    fn pre_process_submit(&mut self, submit_info: &SubmitInfo<'_>) -> Result<InternalSubmitInfo> {
        let _ = submit_info;
        Ok(InternalSubmitInfo::default())
    }
}

/// Queue context that shapes nothing; timestamp memory is created on request.
pub struct BaseQueueContext {
    timestamps: TimestampMemory,
}

impl BaseQueueContext {
    pub fn new(mem_mgr: Arc<dyn MemoryManager>) -> Self {
        Self {
            timestamps: TimestampMemory::new(mem_mgr),
        }
    }

    pub fn create_timestamp_mem(&mut self, need_wait_for_idle_mem: bool) -> Result<()> {
        self.timestamps.create(need_wait_for_idle_mem)
    }
}

impl QueueContext for BaseQueueContext {
    fn timestamps(&self) -> &TimestampMemory {
        &self.timestamps
    }
}

/// Queue context that brackets each submission with a preamble and a
/// timestamp-writing postamble.
///
/// Fence values are 32-bit and compared with wrap-around, so a value counts
/// as reached once it is no more than 2^31 behind the timestamp.
pub struct TimestampQueueContext {
    timestamps: TimestampMemory,
    need_wait_for_idle_mem: bool,
    last_timestamp: u32,
    failure: Option<PalError>,
}

impl TimestampQueueContext {
    pub fn new(mem_mgr: Arc<dyn MemoryManager>, need_wait_for_idle_mem: bool) -> Self {
        Self {
            timestamps: TimestampMemory::new(mem_mgr),
            need_wait_for_idle_mem,
            last_timestamp: 0,
            failure: None,
        }
    }

    /// Fence value written by the postamble of the latest submission.
    pub fn last_timestamp(&self) -> u32 {
        self.last_timestamp
    }

    pub fn has_completed(&self, fence: u32) -> Result<bool> {
        let current = self.timestamps.read_exclusive_exec()?;
        Ok(timestamp_reached(current, fence))
    }

    /// True once every submission handed out so far has finished.
    pub fn is_idle(&self) -> Result<bool> {
        if self.timestamps.state() == QueueContextState::Uninitialized {
            return Ok(true);
        }
        let current = if self.timestamps.wait_for_idle_ts().is_bound() {
            self.timestamps.read_wait_for_idle()?
        } else {
            self.timestamps.read_exclusive_exec()?
        };
        Ok(timestamp_reached(current, self.last_timestamp))
    }
}

impl QueueContext for TimestampQueueContext {
    fn timestamps(&self) -> &TimestampMemory {
        &self.timestamps
    }

    fn pre_process_submit(&mut self, submit_info: &SubmitInfo<'_>) -> Result<InternalSubmitInfo> {
        if self.failure.is_some() {
            return Err(PalError::Indeterminate("timestamp memory creation failed"));
        }

        if self.timestamps.state() == QueueContextState::Uninitialized {
            if let Err(err) = self.timestamps.create(self.need_wait_for_idle_mem) {
                log::error!("queue: timestamp memory creation failed: {}", err);
                self.failure = Some(err);
                return Err(err);
            }
        }

        self.last_timestamp = self.last_timestamp.wrapping_add(1);
        log::trace!(
            "queue: submit of {} streams signals timestamp {}",
            submit_info.cmd_stream_count,
            self.last_timestamp
        );

        Ok(InternalSubmitInfo {
            num_preamble_cmd_streams: 1,
            num_postamble_cmd_streams: 1,
            paging_fence: self.timestamps.memory_manager().paging_fence(),
        })
    }
}

#[inline]
fn timestamp_reached(current: u32, fence: u32) -> bool {
    current.wrapping_sub(fence) as i32 >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::NullMemoryManager;

    /// Hides the persistent CPU address so every read has to map.
    struct MapOnly(NullMemoryManager);

    impl MemoryManager for MapOnly {
        fn allocate_gpu_mem(
            &self,
            create_info: &GpuMemoryCreateInfo,
            internal_info: &GpuMemoryInternalCreateInfo,
        ) -> Result<(GpuMemory, u64)> {
            self.0.allocate_gpu_mem(create_info, internal_info)
        }

        fn free_gpu_mem(&self, memory: GpuMemory, offset: u64) {
            self.0.free_gpu_mem(memory, offset)
        }

        fn map(&self, memory: GpuMemory) -> Result<NonNull<u8>> {
            self.0.map(memory)
        }

        fn unmap(&self, memory: GpuMemory) -> Result<()> {
            self.0.unmap(memory)
        }

        fn gpu_virt_addr(&self, memory: GpuMemory) -> u64 {
            self.0.gpu_virt_addr(memory)
        }
    }

    #[test]
    fn polling_reads_without_mapping() {
        let mm = Arc::new(NullMemoryManager::new());
        let mut ts = TimestampMemory::new(mm.clone());
        ts.create(true).unwrap();
        let memory = ts.exclusive_exec_ts().memory().unwrap();

        mm.fail_next_map(PalError::NotMappable);
        assert_eq!(ts.read_exclusive_exec(), Ok(0));
        mm.write_u32(memory, 4, 9).unwrap();
        assert_eq!(ts.read_wait_for_idle(), Ok(9));

        // Polling never mapped, so the injected failure is still pending.
        assert_eq!(mm.map(memory), Err(PalError::NotMappable));

        drop(ts);
        assert_eq!(mm.free_count(), 1);
        assert_eq!(mm.live_allocations(), 0);
    }

    #[test]
    fn polling_maps_when_no_cpu_address_is_kept() {
        let mm = Arc::new(MapOnly(NullMemoryManager::new()));
        let mut ts = TimestampMemory::new(mm.clone());
        ts.create(false).unwrap();
        let memory = ts.exclusive_exec_ts().memory().unwrap();

        mm.0.write_u32(memory, 0, 3).unwrap();
        assert_eq!(ts.read_exclusive_exec(), Ok(3));
        mm.0.fail_next_map(PalError::NotMappable);
        assert_eq!(ts.read_exclusive_exec(), Err(PalError::NotMappable));

        drop(ts);
        assert_eq!(mm.0.live_allocations(), 0);
    }

    #[test]
    fn reached_handles_wraparound() {
        assert!(timestamp_reached(5, 5));
        assert!(timestamp_reached(6, 5));
        assert!(!timestamp_reached(4, 5));
        assert!(timestamp_reached(2, u32::MAX - 1));
        assert!(!timestamp_reached(u32::MAX - 1, 2));
    }
}
