use bitflags::bitflags;

#[cfg(feature = "palcore-serde")]
use serde::{Deserialize, Serialize};

use crate::GpuHeap;

/// API-level shader stage. The discriminants index [`PipelineInfo::shader`].
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum ShaderType {
    Compute = 0,
    Reserved0,
    Vertex,
    Hull,
    Domain,
    Geometry,
    Reserved1,
    Pixel,
}

pub const NUM_SHADER_TYPES: usize = 8;

impl ShaderType {
    pub const ALL: [ShaderType; NUM_SHADER_TYPES] = [
        ShaderType::Compute,
        ShaderType::Reserved0,
        ShaderType::Vertex,
        ShaderType::Hull,
        ShaderType::Domain,
        ShaderType::Geometry,
        ShaderType::Reserved1,
        ShaderType::Pixel,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The stage-mask bit for this stage; empty for the reserved slots.
    pub fn stage_flag(self) -> ApiShaderStageFlags {
        match self {
            ShaderType::Reserved0 | ShaderType::Reserved1 => ApiShaderStageFlags::empty(),
            other => ApiShaderStageFlags::from_bits_truncate(1 << other as u32),
        }
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ApiShaderStageFlags: u32 {
        const COMPUTE  = 1 << 0;
        const VERTEX   = 1 << 2;
        const HULL     = 1 << 3;
        const DOMAIN   = 1 << 4;
        const GEOMETRY = 1 << 5;
        const PIXEL    = 1 << 7;
    }
}

impl ApiShaderStageFlags {
    pub fn stages(self) -> impl Iterator<Item = ShaderType> {
        ShaderType::ALL
            .into_iter()
            .filter(move |stage| {
                !stage.stage_flag().is_empty() && self.contains(stage.stage_flag())
            })
    }
}

/// Physical hardware stage a shader runs on.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum HardwareStage {
    Ls = 0,
    Hs,
    Es,
    Gs,
    Vs,
    Ps,
    Cs,
}

pub const NUM_HARDWARE_STAGES: usize = 7;

impl HardwareStage {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => HardwareStage::Ls,
            1 => HardwareStage::Hs,
            2 => HardwareStage::Es,
            3 => HardwareStage::Gs,
            4 => HardwareStage::Vs,
            5 => HardwareStage::Ps,
            6 => HardwareStage::Cs,
            _ => return None,
        })
    }

    pub fn flag(self) -> HardwareStageFlags {
        HardwareStageFlags::from_bits_truncate(1 << self as u32)
    }
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HardwareStageFlags: u32 {
        const LS = 1 << 0;
        const HS = 1 << 1;
        const ES = 1 << 2;
        const GS = 1 << 3;
        const VS = 1 << 4;
        const PS = 1 << 5;
        const CS = 1 << 6;
    }
}

/// Which hardware stages each API stage was compiled onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApiHwShaderMapping {
    pub api_shaders: [HardwareStageFlags; NUM_SHADER_TYPES],
}

impl ApiHwShaderMapping {
    pub fn hw_stages(&self, stage: ShaderType) -> HardwareStageFlags {
        self.api_shaders[stage.index()]
    }
}

/// 128-bit pipeline identifier. `stable` survives non-semantic recompiles,
/// `unique` changes with every compile.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PipelineHash {
    pub stable: u64,
    pub unique: u64,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ShaderHash {
    pub lower: u64,
    pub upper: u64,
}

impl ShaderHash {
    pub fn is_zero(&self) -> bool {
        self.lower == 0 && self.upper == 0
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PsInfo {
    /// Shader instructions want per-sample execution.
    pub per_sample_shading: bool,
}

/// Hashes reported for a compiled pipeline.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PipelineInfo {
    pub internal_pipeline_hash: PipelineHash,
    /// Zero for stages without a shader.
    pub shader: [ShaderHash; NUM_SHADER_TYPES],
    pub ps: PsInfo,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CommonShaderStats {
    pub num_used_vgprs: u32,
    pub num_used_sgprs: u32,
    pub lds_size_per_thread_group: u32,
    pub lds_usage_size_in_bytes: u32,
    pub scratch_mem_usage_in_bytes: u32,
}

bitflags! {
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderOperations: u32 {
        const WRITES_UAV   = 1 << 0;
        const WRITES_DEPTH = 1 << 1;
        const STREAM_OUT   = 1 << 2;
    }
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ComputeShaderStats {
    pub num_threads_per_group_x: u32,
    pub num_threads_per_group_y: u32,
    pub num_threads_per_group_z: u32,
}

/// Compilation statistics of one hardware shader. When stages were merged,
/// `shader_stage_mask` has several bits set and each of them reports this
/// same record.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ShaderStats {
    pub shader_stage_mask: ApiShaderStageFlags,
    pub common: CommonShaderStats,
    pub num_available_vgprs: u32,
    pub num_available_sgprs: u32,
    /// Zero unless disassembly was requested.
    pub isa_size_in_bytes: usize,
    pub pal_shader_hash: ShaderHash,
    pub shader_operations: ShaderOperations,
    pub cs: ComputeShaderStats,
    pub copy_shader: Option<CommonShaderStats>,
}

bitflags! {
    /// Flags shared by compute and graphics create infos. Bit positions are
    /// part of the serialized create-info format.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
    pub struct PipelineCreateFlags: u32 {
        /// Internal pipeline not created by the application.
        const CLIENT_INTERNAL   = 1 << 0;
        /// Upload to `preferred_heap` instead of the default heap.
        const OVERRIDE_GPU_HEAP = 1 << 1;
    }
}

/// Creation parameters of a compute pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputePipelineCreateInfo<'a> {
    pub flags: PipelineCreateFlags,
    pub pipeline_binary: &'a [u8],
    pub preferred_heap: GpuHeap,
    /// Symbols whose addresses are resolved at creation. Only honoured by
    /// interface versions below 556.
    pub indirect_funcs: &'a [&'a str],
    /// Only honoured by interface versions 580 and later.
    pub max_function_call_depth: u32,
    /// Only honoured by interface versions 622 and later.
    pub disable_partial_dispatch_preemption: bool,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub enum PrimitiveType {
    Point,
    Line,
    #[default]
    Triangle,
    Rect,
    Quad,
    Patch,
}

pub const MAX_PATCH_CONTROL_POINTS: u32 = 32;

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub enum DepthRange {
    #[default]
    ZeroToOne,
    NegativeOneToOne,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub enum PointOrigin {
    #[default]
    UpperLeft,
    LowerLeft,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub enum ShadeMode {
    #[default]
    Gouraud,
    Flat,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub enum PsShadingRate {
    #[default]
    Default,
    SampleRate,
    PixelRate,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub enum LogicOp {
    #[default]
    Copy,
    Clear,
    And,
    AndReverse,
    AndInverted,
    Noop,
    Xor,
    Or,
    Nor,
    Equiv,
    Invert,
    OrReverse,
    CopyInverted,
    OrInverted,
    Nand,
    Set,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub enum BinningOverride {
    #[default]
    Default,
    Disable,
    Enable,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "palcore-serde", derive(Serialize, Deserialize))]
pub enum Format {
    /// No color target bound at this slot.
    #[default]
    Undefined,
    R8Unorm,
    R32Uint,
    RGBA8Unorm,
    BGRA8Unorm,
    RGBA16Float,
    RGBA32Float,
}

pub const MAX_COLOR_TARGETS: usize = 8;
pub const MAX_VIEW_INSTANCE_COUNT: usize = 6;

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TopologyInfo {
    pub primitive_type: PrimitiveType,
    /// Only meaningful for [`PrimitiveType::Patch`].
    pub patch_control_points: u32,
    pub adjacency: bool,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct InputAssemblyState {
    pub topology_info: TopologyInfo,
    pub vertex_buffer_count: u32,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RasterizerState {
    pub point_coord_origin: PointOrigin,
    pub expand_line_width: bool,
    pub shade_mode: ShadeMode,
    pub rasterize_last_line_pixel: bool,
    pub out_of_order_prims_enable: bool,
    pub perp_line_end_caps_enable: bool,
    pub binning_override: BinningOverride,
    pub depth_clamp_disable: bool,
    pub clip_dist_mask: u8,
    pub forced_shading_rate: PsShadingRate,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ColorTargetInfo {
    pub format: Format,
    /// Bit 0 red, bit 1 green, bit 2 blue, bit 3 alpha.
    pub channel_write_mask: u8,
    pub force_alpha_to_one: bool,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ColorBlendState {
    pub alpha_to_coverage_enable: bool,
    pub dual_source_blend_enable: bool,
    pub logic_op: LogicOp,
    pub uav_export_single_draw: bool,
    pub target: [ColorTargetInfo; MAX_COLOR_TARGETS],
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ViewInstancingDescriptor {
    pub view_instance_count: u32,
    pub view_id: [u32; MAX_VIEW_INSTANCE_COUNT],
    pub render_target_array_idx: [u32; MAX_VIEW_INSTANCE_COUNT],
    pub viewport_array_idx: [u16; MAX_VIEW_INSTANCE_COUNT],
    pub enable_masking: bool,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MsaaCoverageOutDescriptor {
    pub enable: bool,
    /// At most 15.
    pub num_samples: u8,
    /// Render target index, at most 7.
    pub mrt: u8,
    /// 0 = x, 1 = y, 2 = z, 3 = w.
    pub channel: u8,
}

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ViewportInfo {
    pub depth_clip_enable: bool,
    pub depth_range: DepthRange,
}

/// Creation parameters of a graphics pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphicsPipelineCreateInfo<'a> {
    pub flags: PipelineCreateFlags,
    pub pipeline_binary: &'a [u8],
    pub preferred_heap: GpuHeap,
    pub use_late_alloc_vs_limit: bool,
    pub late_alloc_vs_limit: u32,
    pub ia_state: InputAssemblyState,
    pub rs_state: RasterizerState,
    pub cb_state: ColorBlendState,
    pub view_instancing_desc: ViewInstancingDescriptor,
    pub coverage_out_desc: MsaaCoverageOutDescriptor,
    pub viewport_info: ViewportInfo,
}
