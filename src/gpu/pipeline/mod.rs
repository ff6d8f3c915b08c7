//! Hardware-resident compute and graphics pipelines.
//!
//! A [`Pipeline`] is built once from a pipeline binary, uploaded through the
//! context's [`MemoryManager`] and afterwards only changes through
//! [`Pipeline::link_with_libraries`], [`Pipeline::set_stack_size_in_bytes`] and
//! the client data slot.
//!
//! Byte and list queries follow the two-call convention: pass `None` as the
//! output buffer to learn the required size, then pass a buffer together with
//! exactly that size.

pub mod binary;
pub mod isa;
mod structs;
mod upload;

pub use structs::*;
pub(crate) use upload::PipelineUploader;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use binary::{BinaryKind, PipelineBinary, ShaderRecord};

use crate::{
    GpuHeap, GpuMemSubAllocInfo, InterfaceVersion, MemoryManager, PalError, Result, Settings,
    ShaderLibrary,
};

/// Opaque per-layer data attached to a pipeline by its owner.
pub type ClientData = Arc<dyn Any + Send + Sync>;

/// Link and stack state of a compute pipeline.
pub struct ComputeState {
    abi_major: u16,
    wavefront_size: u32,
    user_data_layout_hash: u64,
    num_available_vgprs: u32,
    num_available_sgprs: u32,
    own_stack_size: u32,
    max_function_call_depth: u32,
    disable_partial_dispatch_preemption: bool,
    local_functions: HashMap<String, u64>,
    linked_functions: HashMap<String, u64>,
    libraries: Vec<Arc<dyn ShaderLibrary>>,
    max_library_stack_size: u32,
    max_library_vgprs: u32,
    max_library_sgprs: u32,
    indirect_function_addresses: Vec<u64>,
    default_stack_size: u32,
    stack_size_override: Option<u32>,
}

impl ComputeState {
    fn function_addr(&self, name: &str) -> Option<u64> {
        self.local_functions
            .get(name)
            .or_else(|| self.linked_functions.get(name))
            .copied()
    }

    fn is_linked(&self, library: &Arc<dyn ShaderLibrary>) -> bool {
        self.libraries.iter().any(|l| same_library(l, library))
    }

    fn compute_default_stack_size(&self) -> u32 {
        self.max_function_call_depth
            .saturating_mul(self.max_library_stack_size)
            .saturating_add(self.own_stack_size)
    }

    pub fn max_function_call_depth(&self) -> u32 {
        self.max_function_call_depth
    }

    pub fn disable_partial_dispatch_preemption(&self) -> bool {
        self.disable_partial_dispatch_preemption
    }
}

/// Fixed-function state of a graphics pipeline.
#[derive(Debug, Clone, Copy)]
pub struct GraphicsState {
    pub ia_state: InputAssemblyState,
    pub rs_state: RasterizerState,
    pub cb_state: ColorBlendState,
    pub view_instancing_desc: ViewInstancingDescriptor,
    pub coverage_out_desc: MsaaCoverageOutDescriptor,
    pub viewport_info: ViewportInfo,
    pub late_alloc_vs_limit: Option<u32>,
}

impl GraphicsState {
    fn new(create_info: &GraphicsPipelineCreateInfo<'_>) -> Result<Self> {
        if create_info.view_instancing_desc.view_instance_count as usize > MAX_VIEW_INSTANCE_COUNT {
            return Err(PalError::InvalidValue);
        }

        let topology = &create_info.ia_state.topology_info;
        if topology.primitive_type == PrimitiveType::Patch
            && !(1..=MAX_PATCH_CONTROL_POINTS).contains(&topology.patch_control_points)
        {
            return Err(PalError::InvalidValue);
        }

        let coverage = &create_info.coverage_out_desc;
        if coverage.enable
            && (coverage.num_samples > 15 || coverage.mrt > 7 || coverage.channel > 3)
        {
            return Err(PalError::InvalidValue);
        }

        Ok(Self {
            ia_state: create_info.ia_state,
            rs_state: create_info.rs_state,
            cb_state: create_info.cb_state,
            view_instancing_desc: create_info.view_instancing_desc,
            coverage_out_desc: create_info.coverage_out_desc,
            viewport_info: create_info.viewport_info,
            late_alloc_vs_limit: create_info
                .use_late_alloc_vs_limit
                .then_some(create_info.late_alloc_vs_limit),
        })
    }
}

pub enum PipelineKind {
    Compute(ComputeState),
    Graphics(GraphicsState),
}

pub struct Pipeline {
    kind: PipelineKind,
    info: PipelineInfo,
    flags: PipelineCreateFlags,
    interface_version: InterfaceVersion,
    shaders: Vec<ShaderRecord>,
    api_hw_mapping: ApiHwShaderMapping,
    allocations: Vec<GpuMemSubAllocInfo>,
    code_gpu_va: u64,
    code: Vec<u8>,
    perf_data: Vec<u8>,
    code_object: Option<Vec<u8>>,
    client_data: Option<ClientData>,
}

fn same_library(a: &Arc<dyn ShaderLibrary>, b: &Arc<dyn ShaderLibrary>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Fills `buffer` using the two-call convention.
fn copy_out(data: &[u8], size: &mut usize, buffer: Option<&mut [u8]>) -> Result<()> {
    match buffer {
        None => {
            *size = data.len();
            Ok(())
        }
        Some(buffer) => {
            if *size != data.len() || buffer.len() < data.len() {
                return Err(PalError::InvalidValue);
            }
            buffer[..data.len()].copy_from_slice(data);
            Ok(())
        }
    }
}

struct Uploaded {
    allocations: Vec<GpuMemSubAllocInfo>,
    code_gpu_va: u64,
}

impl Pipeline {
    pub(crate) fn new_compute(
        mem_mgr: &dyn MemoryManager,
        settings: &Settings,
        create_info: &ComputePipelineCreateInfo<'_>,
    ) -> Result<Self> {
        let version = settings.interface_version;
        let binary = Self::parse(settings, create_info.pipeline_binary, BinaryKind::Compute)?;
        let cs = &binary.shaders[0];

        let max_function_call_depth = if version.supports_stack_size_override() {
            create_info.max_function_call_depth.max(1)
        } else {
            if create_info.max_function_call_depth != 0 {
                log::warn!(
                    "pipeline: max_function_call_depth ignored by interface version {}",
                    version.0
                );
            }
            1
        };

        let disable_partial_dispatch_preemption =
            if version.supports_partial_dispatch_preemption_control() {
                create_info.disable_partial_dispatch_preemption
            } else {
                if create_info.disable_partial_dispatch_preemption {
                    log::warn!(
                        "pipeline: disable_partial_dispatch_preemption ignored by interface \
                         version {}",
                        version.0
                    );
                }
                false
            };

        let heap = Self::heap(settings, create_info.flags, create_info.preferred_heap);
        let mut uploader = PipelineUploader::new(mem_mgr, heap);
        let code_gpu_va = Self::upload_sections(&mut uploader, &binary)?;

        let local_functions: HashMap<String, u64> = binary
            .symbols
            .iter()
            .map(|s| (s.name.clone(), code_gpu_va + u64::from(s.code_offset)))
            .collect();

        let mut indirect_function_addresses = Vec::new();
        if version.resolves_indirect_funcs_at_creation() {
            for name in create_info.indirect_funcs {
                let addr = local_functions
                    .get(*name)
                    .copied()
                    .ok_or(PalError::BadPipelineData("unknown indirect function"))?;
                indirect_function_addresses.push(addr);
            }
        } else if !create_info.indirect_funcs.is_empty() {
            log::warn!(
                "pipeline: indirect_funcs ignored by interface version {}",
                version.0
            );
        }

        let mut state = ComputeState {
            abi_major: binary.abi_major,
            wavefront_size: binary.wavefront_size,
            user_data_layout_hash: binary.user_data_layout_hash,
            num_available_vgprs: cs.num_available_vgprs,
            num_available_sgprs: cs.num_available_sgprs,
            own_stack_size: binary.stack_size_in_bytes,
            max_function_call_depth,
            disable_partial_dispatch_preemption,
            local_functions,
            linked_functions: HashMap::new(),
            libraries: Vec::new(),
            max_library_stack_size: 0,
            max_library_vgprs: 0,
            max_library_sgprs: 0,
            indirect_function_addresses,
            default_stack_size: 0,
            stack_size_override: None,
        };
        state.default_stack_size = state.compute_default_stack_size();

        let uploaded = Uploaded {
            allocations: uploader.finish(),
            code_gpu_va,
        };
        Ok(Self::assemble(
            settings,
            create_info.flags,
            create_info.pipeline_binary,
            binary,
            uploaded,
            PipelineKind::Compute(state),
        ))
    }

    pub(crate) fn new_graphics(
        mem_mgr: &dyn MemoryManager,
        settings: &Settings,
        create_info: &GraphicsPipelineCreateInfo<'_>,
    ) -> Result<Self> {
        let state = GraphicsState::new(create_info)?;
        let binary = Self::parse(settings, create_info.pipeline_binary, BinaryKind::Graphics)?;

        let heap = Self::heap(settings, create_info.flags, create_info.preferred_heap);
        let mut uploader = PipelineUploader::new(mem_mgr, heap);
        let code_gpu_va = Self::upload_sections(&mut uploader, &binary)?;
        let uploaded = Uploaded {
            allocations: uploader.finish(),
            code_gpu_va,
        };

        Ok(Self::assemble(
            settings,
            create_info.flags,
            create_info.pipeline_binary,
            binary,
            uploaded,
            PipelineKind::Graphics(state),
        ))
    }

    fn parse(settings: &Settings, bytes: &[u8], expected: BinaryKind) -> Result<PipelineBinary> {
        let binary = PipelineBinary::parse(bytes)?;
        if binary.kind != expected {
            return Err(PalError::BadPipelineData("binary kind does not match the pipeline kind"));
        }
        if settings.validate_hashes
            && binary.pipeline_hash.stable == 0
            && binary.pipeline_hash.unique == 0
        {
            return Err(PalError::BadPipelineData("pipeline hash is zero"));
        }
        Ok(binary)
    }

    fn heap(settings: &Settings, flags: PipelineCreateFlags, preferred: GpuHeap) -> GpuHeap {
        if flags.contains(PipelineCreateFlags::OVERRIDE_GPU_HEAP) {
            preferred
        } else {
            settings.default_pipeline_heap
        }
    }

    fn upload_sections(
        uploader: &mut PipelineUploader<'_>,
        binary: &PipelineBinary,
    ) -> Result<u64> {
        let code_gpu_va = uploader.upload(&binary.code)?;
        uploader.upload(&binary.data)?;
        uploader.upload(&binary.perf_data)?;
        Ok(code_gpu_va)
    }

    fn assemble(
        settings: &Settings,
        flags: PipelineCreateFlags,
        blob: &[u8],
        binary: PipelineBinary,
        uploaded: Uploaded,
        kind: PipelineKind,
    ) -> Self {
        let mut info = PipelineInfo {
            internal_pipeline_hash: binary.pipeline_hash,
            ps: PsInfo {
                per_sample_shading: binary.per_sample_shading,
            },
            ..Default::default()
        };
        let mut api_hw_mapping = ApiHwShaderMapping::default();
        for shader in &binary.shaders {
            for stage in shader.api_stages.stages() {
                info.shader[stage.index()] = shader.hash;
                api_hw_mapping.api_shaders[stage.index()] |= shader.hw_stage.flag();
            }
        }

        log::debug!(
            "pipeline: created {} pipeline 0x{:016X}{:016X} ({} allocations, code at 0x{:X})",
            match kind {
                PipelineKind::Compute(_) => "compute",
                PipelineKind::Graphics(_) => "graphics",
            },
            info.internal_pipeline_hash.unique,
            info.internal_pipeline_hash.stable,
            uploaded.allocations.len(),
            uploaded.code_gpu_va
        );

        Self {
            kind,
            info,
            flags,
            interface_version: settings.interface_version,
            shaders: binary.shaders,
            api_hw_mapping,
            allocations: uploaded.allocations,
            code_gpu_va: uploaded.code_gpu_va,
            code: binary.code,
            perf_data: binary.perf_data,
            code_object: settings.retain_code_object.then(|| blob.to_vec()),
            client_data: None,
        }
    }

    /// Frees every GPU allocation backing the pipeline.
    pub(crate) fn destroy(self, mem_mgr: &dyn MemoryManager) {
        for alloc in &self.allocations {
            mem_mgr.free_gpu_mem(alloc.gpu_memory, alloc.offset);
        }
        log::debug!(
            "pipeline: destroyed 0x{:016X}{:016X}",
            self.info.internal_pipeline_hash.unique,
            self.info.internal_pipeline_hash.stable
        );
    }

    pub fn kind(&self) -> &PipelineKind {
        &self.kind
    }

    pub fn is_compute(&self) -> bool {
        matches!(self.kind, PipelineKind::Compute(_))
    }

    pub fn flags(&self) -> PipelineCreateFlags {
        self.flags
    }

    pub fn info(&self) -> &PipelineInfo {
        &self.info
    }

    pub fn code_gpu_virt_addr(&self) -> u64 {
        self.code_gpu_va
    }

    /// Reports the allocations backing this pipeline.
    ///
    /// With `list == None` the count is written and its input ignored.
    /// Otherwise the input count must equal the number of allocations.
    pub fn query_allocation_info(
        &self,
        num_entries: Option<&mut usize>,
        list: Option<&mut [GpuMemSubAllocInfo]>,
    ) -> Result<()> {
        let num_entries = num_entries.ok_or(PalError::InvalidPointer)?;
        match list {
            None => {
                *num_entries = self.allocations.len();
                Ok(())
            }
            Some(list) => {
                if *num_entries != self.allocations.len() || list.len() < self.allocations.len() {
                    return Err(PalError::InvalidValue);
                }
                list[..self.allocations.len()].copy_from_slice(&self.allocations);
                Ok(())
            }
        }
    }

    /// The binary this pipeline was created from, byte for byte.
    pub fn code_object(&self, size: &mut usize, buffer: Option<&mut [u8]>) -> Result<()> {
        let blob = self.code_object.as_deref().ok_or(PalError::Unavailable)?;
        copy_out(blob, size, buffer)
    }

    pub fn shader_code(
        &self,
        stage: ShaderType,
        size: &mut usize,
        buffer: Option<&mut [u8]>,
    ) -> Result<()> {
        let shader = self.shader(stage).ok_or(PalError::Unavailable)?;
        let isa = &self.code[shader.isa.clone()];
        if isa.is_empty() {
            return Err(PalError::Unavailable);
        }
        copy_out(isa, size, buffer)
    }

    pub fn performance_data(
        &self,
        hw_stage: HardwareStage,
        size: &mut usize,
        buffer: Option<&mut [u8]>,
    ) -> Result<()> {
        let shader = self
            .shaders
            .iter()
            .find(|s| s.hw_stage == hw_stage)
            .ok_or(PalError::Unavailable)?;
        let data = &self.perf_data[shader.perf_data.clone()];
        if data.is_empty() {
            return Err(PalError::Unavailable);
        }
        copy_out(data, size, buffer)
    }

    /// Statistics of the hardware shader running `stage`. The ISA is only
    /// disassembled when `get_disassembly_size` is set.
    pub fn shader_stats(
        &self,
        stage: ShaderType,
        get_disassembly_size: bool,
    ) -> Result<ShaderStats> {
        let shader = self.shader(stage).ok_or(PalError::Unavailable)?;

        let isa_size_in_bytes = if get_disassembly_size {
            isa::disassemble(&self.code[shader.isa.clone()])
                .ok_or(PalError::Unavailable)?
                .len()
        } else {
            0
        };

        let mut stats = ShaderStats {
            shader_stage_mask: shader.api_stages,
            common: shader.common,
            num_available_vgprs: shader.num_available_vgprs,
            num_available_sgprs: shader.num_available_sgprs,
            isa_size_in_bytes,
            pal_shader_hash: shader.pal_hash,
            shader_operations: shader.operations,
            cs: ComputeShaderStats::default(),
            copy_shader: shader.copy_shader,
        };

        if let PipelineKind::Compute(state) = &self.kind {
            stats.cs = shader.cs;
            stats.common.num_used_vgprs = stats.common.num_used_vgprs.max(state.max_library_vgprs);
            stats.common.num_used_sgprs = stats.common.num_used_sgprs.max(state.max_library_sgprs);
        }

        Ok(stats)
    }

    pub fn api_hw_shader_mapping(&self) -> ApiHwShaderMapping {
        self.api_hw_mapping
    }

    /// Makes functions exported by `libraries` callable from this pipeline.
    ///
    /// Every library is validated before anything changes, so an error leaves
    /// the link state untouched. Libraries already linked are skipped. Any
    /// successful call discards a stack size set through
    /// [`Self::set_stack_size_in_bytes`].
    ///
    /// Must complete before the pipeline is bound to work that calls into the
    /// new libraries.
    pub fn link_with_libraries(&mut self, libraries: &[Arc<dyn ShaderLibrary>]) -> Result<()> {
        let state = match &mut self.kind {
            PipelineKind::Compute(state) => state,
            PipelineKind::Graphics(_) => return Err(PalError::Unavailable),
        };

        let mut new_libraries: Vec<&Arc<dyn ShaderLibrary>> = Vec::new();
        let mut new_functions: HashMap<&str, u64> = HashMap::new();
        for library in libraries {
            if state.is_linked(library) || new_libraries.iter().any(|l| same_library(l, library)) {
                continue;
            }

            if library.abi_major_version() != state.abi_major {
                return Err(PalError::BadPipelineData("library ABI version mismatch"));
            }
            if library.wavefront_size() != state.wavefront_size {
                return Err(PalError::BadPipelineData("library wavefront size mismatch"));
            }
            if library.user_data_layout_hash() != state.user_data_layout_hash {
                return Err(PalError::BadPipelineData("library user data layout mismatch"));
            }

            for function in library.functions() {
                if function.num_vgprs > state.num_available_vgprs
                    || function.num_sgprs > state.num_available_sgprs
                {
                    return Err(PalError::BadPipelineData(
                        "library function exceeds the register budget",
                    ));
                }

                let existing = state
                    .function_addr(&function.name)
                    .or_else(|| new_functions.get(function.name.as_str()).copied());
                match existing {
                    Some(addr) if addr != function.gpu_virt_addr => {
                        return Err(PalError::BadPipelineData(
                            "conflicting definitions of a library function",
                        ));
                    }
                    Some(_) => {}
                    None => {
                        new_functions.insert(&function.name, function.gpu_virt_addr);
                    }
                }
            }

            new_libraries.push(library);
        }

        for (name, addr) in new_functions {
            state.linked_functions.insert(name.to_owned(), addr);
        }
        for library in new_libraries {
            for function in library.functions() {
                state.max_library_stack_size =
                    state.max_library_stack_size.max(function.stack_size_in_bytes);
                state.max_library_vgprs = state.max_library_vgprs.max(function.num_vgprs);
                state.max_library_sgprs = state.max_library_sgprs.max(function.num_sgprs);
            }
            state.libraries.push(Arc::clone(library));
        }

        state.stack_size_override = None;
        state.default_stack_size = state.compute_default_stack_size();
        log::debug!(
            "pipeline: {} libraries linked, stack size {} bytes",
            state.libraries.len(),
            state.default_stack_size
        );
        Ok(())
    }

    /// Overrides the indirect-call stack reservation until the next link.
    pub fn set_stack_size_in_bytes(&mut self, stack_size_in_bytes: u32) -> Result<()> {
        let state = match &mut self.kind {
            PipelineKind::Compute(state) => state,
            PipelineKind::Graphics(_) => return Err(PalError::Unavailable),
        };
        if !self.interface_version.supports_stack_size_override() {
            return Err(PalError::Unavailable);
        }

        if stack_size_in_bytes > state.default_stack_size {
            log::warn!(
                "pipeline: stack size override {} exceeds computed size {}",
                stack_size_in_bytes,
                state.default_stack_size
            );
        }
        state.stack_size_override = Some(stack_size_in_bytes);
        Ok(())
    }

    /// Effective stack reservation of a compute pipeline.
    pub fn stack_size_in_bytes(&self) -> Option<u32> {
        match &self.kind {
            PipelineKind::Compute(state) => {
                Some(state.stack_size_override.unwrap_or(state.default_stack_size))
            }
            PipelineKind::Graphics(_) => None,
        }
    }

    /// Address of a function defined by the pipeline or a linked library.
    pub fn function_gpu_virt_addr(&self, name: &str) -> Option<u64> {
        match &self.kind {
            PipelineKind::Compute(state) => state.function_addr(name),
            PipelineKind::Graphics(_) => None,
        }
    }

    /// Addresses of `indirect_funcs` resolved at creation, in request order.
    pub fn indirect_function_addresses(&self) -> &[u64] {
        match &self.kind {
            PipelineKind::Compute(state) => &state.indirect_function_addresses,
            PipelineKind::Graphics(_) => &[],
        }
    }

    pub fn linked_library_count(&self) -> usize {
        match &self.kind {
            PipelineKind::Compute(state) => state.libraries.len(),
            PipelineKind::Graphics(_) => 0,
        }
    }

    pub fn client_data(&self) -> Option<&ClientData> {
        self.client_data.as_ref()
    }

    pub fn set_client_data(&mut self, client_data: Option<ClientData>) {
        self.client_data = client_data;
    }

    fn shader(&self, stage: ShaderType) -> Option<&ShaderRecord> {
        let flag = stage.stage_flag();
        if flag.is_empty() {
            return None;
        }
        self.shaders.iter().find(|s| s.api_stages.contains(flag))
    }
}
