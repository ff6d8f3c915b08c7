use std::sync::Arc;

use crate::utils::{Handle, Pool};
use crate::{
    BaseQueueContext, ComputePipelineCreateInfo, ElfShaderLibrary, GraphicsPipelineCreateInfo,
    MemoryManager, NullMemoryManager, PalError, Pipeline, Result, Settings,
    TimestampQueueContext,
};

/// Owns the memory manager, settings and every live pipeline.
///
/// Pipelines are handed out as generation-checked handles and must be
/// released with [`Context::destroy_pipeline`]. Anything still alive when the
/// context goes away is freed then.
pub struct Context {
    mem_mgr: Arc<dyn MemoryManager>,
    settings: Settings,
    pipelines: Pool<Pipeline>,
}

impl Context {
    pub fn new(mem_mgr: Arc<dyn MemoryManager>, settings: Settings) -> Self {
        log::debug!(
            "context: created (interface version {}, pipeline heap {:?})",
            settings.interface_version.0,
            settings.default_pipeline_heap
        );
        Self {
            mem_mgr,
            settings,
            pipelines: Default::default(),
        }
    }

    /// Context backed by host memory only.
    pub fn headless(settings: Settings) -> Self {
        Self::new(Arc::new(NullMemoryManager::new()), settings)
    }

    pub fn memory_manager(&self) -> &Arc<dyn MemoryManager> {
        &self.mem_mgr
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn make_compute_pipeline(
        &mut self,
        info: &ComputePipelineCreateInfo<'_>,
    ) -> Result<Handle<Pipeline>> {
        let pipeline = Pipeline::new_compute(self.mem_mgr.as_ref(), &self.settings, info)?;
        self.insert_pipeline(pipeline)
    }

    pub fn make_graphics_pipeline(
        &mut self,
        info: &GraphicsPipelineCreateInfo<'_>,
    ) -> Result<Handle<Pipeline>> {
        let pipeline = Pipeline::new_graphics(self.mem_mgr.as_ref(), &self.settings, info)?;
        self.insert_pipeline(pipeline)
    }

    fn insert_pipeline(&mut self, pipeline: Pipeline) -> Result<Handle<Pipeline>> {
        match self.pipelines.insert(pipeline) {
            Ok(handle) => Ok(handle),
            Err(pipeline) => {
                pipeline.destroy(self.mem_mgr.as_ref());
                Err(PalError::OutOfSlots)
            }
        }
    }

    pub fn pipeline(&self, handle: Handle<Pipeline>) -> Result<&Pipeline> {
        self.pipelines.get_ref(handle).ok_or_else(|| stale(handle))
    }

    pub fn pipeline_mut(&mut self, handle: Handle<Pipeline>) -> Result<&mut Pipeline> {
        self.pipelines.get_mut_ref(handle).ok_or_else(|| stale(handle))
    }

    /// Releases the pipeline and its GPU memory. The handle, and every copy
    /// of it, stops resolving.
    pub fn destroy_pipeline(&mut self, handle: Handle<Pipeline>) -> Result<()> {
        let pipeline = self.pipelines.take(handle).ok_or_else(|| stale(handle))?;
        pipeline.destroy(self.mem_mgr.as_ref());
        Ok(())
    }

    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    pub fn make_shader_library(&self, binary: &[u8]) -> Result<Arc<ElfShaderLibrary>> {
        ElfShaderLibrary::new(Arc::clone(&self.mem_mgr), &self.settings, binary).map(Arc::new)
    }

    pub fn make_queue_context(&self) -> BaseQueueContext {
        BaseQueueContext::new(Arc::clone(&self.mem_mgr))
    }

    pub fn make_timestamp_queue_context(
        &self,
        need_wait_for_idle_mem: bool,
    ) -> TimestampQueueContext {
        TimestampQueueContext::new(Arc::clone(&self.mem_mgr), need_wait_for_idle_mem)
    }

    /// Destroys every remaining pipeline.
    pub fn destroy(mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        let pipelines = self.pipelines.drain();
        if !pipelines.is_empty() {
            log::debug!("context: releasing {} leftover pipelines", pipelines.len());
        }
        for pipeline in pipelines {
            pipeline.destroy(self.mem_mgr.as_ref());
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn stale(handle: Handle<Pipeline>) -> PalError {
    log::error!("context: pipeline handle {:?} used after release", handle);
    PalError::StaleHandle
}
