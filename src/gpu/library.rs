//! Separately compiled units of callable shader code.

use std::sync::Arc;

use crate::gpu::pipeline::binary::{BinaryKind, PipelineBinary};
use crate::gpu::pipeline::PipelineUploader;
use crate::{GpuMemSubAllocInfo, MemoryManager, PalError, Result, Settings};

/// One function a library exports for indirect calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LibraryFunction {
    pub name: String,
    pub gpu_virt_addr: u64,
    pub stack_size_in_bytes: u32,
    pub num_vgprs: u32,
    pub num_sgprs: u32,
}

/// Code a compute pipeline can link against.
///
/// A library must outlive every pipeline linked to it. Pipelines hold an
/// `Arc` to each linked library, so this holds as long as the library frees
/// its GPU memory only when dropped.
pub trait ShaderLibrary: Send + Sync {
    fn abi_major_version(&self) -> u16;
    fn wavefront_size(&self) -> u32;
    /// Hash of the user-data resource mapping the library was compiled for.
    fn user_data_layout_hash(&self) -> u64;
    fn functions(&self) -> &[LibraryFunction];
}

/// [`ShaderLibrary`] created from a library binary.
pub struct ElfShaderLibrary {
    mem_mgr: Arc<dyn MemoryManager>,
    abi_major: u16,
    wavefront_size: u32,
    user_data_layout_hash: u64,
    functions: Vec<LibraryFunction>,
    allocation: Option<GpuMemSubAllocInfo>,
}

impl ElfShaderLibrary {
    pub fn new(
        mem_mgr: Arc<dyn MemoryManager>,
        settings: &Settings,
        binary: &[u8],
    ) -> Result<Self> {
        let binary = PipelineBinary::parse(binary)?;
        if binary.kind != BinaryKind::Library {
            return Err(PalError::BadPipelineData("binary is not a shader library"));
        }

        let mut uploader = PipelineUploader::new(mem_mgr.as_ref(), settings.default_pipeline_heap);
        let code_va = uploader.upload(&binary.code)?;
        let allocation = uploader.finish().into_iter().next();

        let functions = binary
            .symbols
            .iter()
            .map(|symbol| LibraryFunction {
                name: symbol.name.clone(),
                gpu_virt_addr: code_va + u64::from(symbol.code_offset),
                stack_size_in_bytes: symbol.stack_size_in_bytes,
                num_vgprs: symbol.num_vgprs,
                num_sgprs: symbol.num_sgprs,
            })
            .collect::<Vec<_>>();

        log::debug!(
            "library: created with {} functions at 0x{:X}",
            functions.len(),
            code_va
        );

        Ok(Self {
            mem_mgr,
            abi_major: binary.abi_major,
            wavefront_size: binary.wavefront_size,
            user_data_layout_hash: binary.user_data_layout_hash,
            functions,
            allocation,
        })
    }

    pub fn gpu_memory(&self) -> Option<&GpuMemSubAllocInfo> {
        self.allocation.as_ref()
    }

    pub fn function(&self, name: &str) -> Option<&LibraryFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

impl ShaderLibrary for ElfShaderLibrary {
    fn abi_major_version(&self) -> u16 {
        self.abi_major
    }

    fn wavefront_size(&self) -> u32 {
        self.wavefront_size
    }

    fn user_data_layout_hash(&self) -> u64 {
        self.user_data_layout_hash
    }

    fn functions(&self) -> &[LibraryFunction] {
        &self.functions
    }
}

impl Drop for ElfShaderLibrary {
    fn drop(&mut self) {
        if let Some(alloc) = self.allocation.take() {
            self.mem_mgr.free_gpu_mem(alloc.gpu_memory, alloc.offset);
        }
    }
}
