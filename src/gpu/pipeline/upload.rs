use crate::{
    GpuHeap, GpuMemSubAllocInfo, GpuMemoryCreateInfo, GpuMemoryInternalCreateInfo,
    GpuMemoryInternalFlags, MemoryManager, Result,
};

const SECTION_ALIGNMENT: u64 = 256;

/// Copies binary sections into GPU memory, one allocation per section.
///
/// Allocations stay owned by the uploader until [`Self::finish`]; dropping it
/// earlier frees everything uploaded so far.
pub(crate) struct PipelineUploader<'a> {
    mem_mgr: &'a dyn MemoryManager,
    create_info: GpuMemoryCreateInfo,
    allocations: Vec<GpuMemSubAllocInfo>,
}

impl<'a> PipelineUploader<'a> {
    pub fn new(mem_mgr: &'a dyn MemoryManager, heap: GpuHeap) -> Self {
        let mut create_info = GpuMemoryCreateInfo {
            alignment: SECTION_ALIGNMENT,
            heap_count: 1,
            ..Default::default()
        };
        create_info.heaps[0] = heap;
        if heap != GpuHeap::Local {
            create_info.heaps[1] = GpuHeap::Local;
            create_info.heap_count = 2;
        }

        Self {
            mem_mgr,
            create_info,
            allocations: Vec::new(),
        }
    }

    /// Uploads `bytes` and returns their GPU virtual address, or 0 when
    /// there is nothing to upload.
    pub fn upload(&mut self, bytes: &[u8]) -> Result<u64> {
        if bytes.is_empty() {
            return Ok(0);
        }

        let create_info = GpuMemoryCreateInfo {
            size: bytes.len() as u64,
            ..self.create_info
        };
        let internal_info = GpuMemoryInternalCreateInfo {
            flags: GpuMemoryInternalFlags::PIPELINE_CODE,
        };
        let (memory, offset) = self
            .mem_mgr
            .allocate_gpu_mem(&create_info, &internal_info)?;
        self.allocations.push(GpuMemSubAllocInfo {
            gpu_memory: memory,
            offset,
            size: bytes.len() as u64,
        });

        self.mem_mgr.upload(memory, offset, bytes)?;
        Ok(self.mem_mgr.gpu_virt_addr(memory) + offset)
    }

    pub fn finish(mut self) -> Vec<GpuMemSubAllocInfo> {
        std::mem::take(&mut self.allocations)
    }
}

impl Drop for PipelineUploader<'_> {
    fn drop(&mut self) {
        for alloc in self.allocations.drain(..) {
            self.mem_mgr.free_gpu_mem(alloc.gpu_memory, alloc.offset);
        }
    }
}
