//! Pipeline binary container.
//!
//! Little-endian layout:
//!
//! ```text
//! BinaryHeader
//! RawShaderRecord * shader_count
//! RawSymbol       * symbol_count
//! string table | data | code | perf data   (located by the header)
//! ```
//!
//! Shader ISA ranges index the code section, performance data ranges index
//! the perf data section and symbol names index the string table.

use std::ops::Range;

use bytemuck::{Pod, Zeroable};

use super::structs::{
    ApiShaderStageFlags, CommonShaderStats, ComputeShaderStats, HardwareStage, PipelineHash,
    ShaderHash, ShaderOperations,
};
use crate::{PalError, Result};

pub const MAGIC: u32 = u32::from_le_bytes(*b"PALB");
pub const ABI_MAJOR_VERSION: u16 = 1;
pub const ABI_MINOR_VERSION: u16 = 0;

const HEADER_FLAG_PER_SAMPLE_SHADING: u32 = 1 << 0;
const SHADER_FLAG_COPY_SHADER_PRESENT: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
struct SectionRange {
    offset: u32,
    size: u32,
}

impl SectionRange {
    fn range(&self) -> Range<usize> {
        self.offset as usize..self.offset as usize + self.size as usize
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BinaryHeader {
    magic: u32,
    abi_major: u16,
    abi_minor: u16,
    kind: u32,
    wavefront_size: u32,
    pipeline_hash_stable: u64,
    pipeline_hash_unique: u64,
    user_data_layout_hash: u64,
    stack_size_in_bytes: u32,
    shader_count: u32,
    symbol_count: u32,
    flags: u32,
    string_table: SectionRange,
    data: SectionRange,
    code: SectionRange,
    perf_data: SectionRange,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct RawCommonStats {
    num_used_vgprs: u32,
    num_used_sgprs: u32,
    lds_size_per_thread_group: u32,
    lds_usage_size_in_bytes: u32,
    scratch_mem_usage_in_bytes: u32,
}

impl From<RawCommonStats> for CommonShaderStats {
    fn from(raw: RawCommonStats) -> Self {
        Self {
            num_used_vgprs: raw.num_used_vgprs,
            num_used_sgprs: raw.num_used_sgprs,
            lds_size_per_thread_group: raw.lds_size_per_thread_group,
            lds_usage_size_in_bytes: raw.lds_usage_size_in_bytes,
            scratch_mem_usage_in_bytes: raw.scratch_mem_usage_in_bytes,
        }
    }
}

impl From<CommonShaderStats> for RawCommonStats {
    fn from(stats: CommonShaderStats) -> Self {
        Self {
            num_used_vgprs: stats.num_used_vgprs,
            num_used_sgprs: stats.num_used_sgprs,
            lds_size_per_thread_group: stats.lds_size_per_thread_group,
            lds_usage_size_in_bytes: stats.lds_usage_size_in_bytes,
            scratch_mem_usage_in_bytes: stats.scratch_mem_usage_in_bytes,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RawShaderRecord {
    api_stage_mask: u32,
    hardware_stage: u32,
    hash_lower: u64,
    hash_upper: u64,
    pal_hash_lower: u64,
    pal_hash_upper: u64,
    common: RawCommonStats,
    num_available_vgprs: u32,
    num_available_sgprs: u32,
    operations: u32,
    threads_x: u32,
    threads_y: u32,
    threads_z: u32,
    flags: u32,
    copy_shader: RawCommonStats,
    isa: SectionRange,
    perf_data: SectionRange,
    _reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RawSymbol {
    name: SectionRange,
    code_offset: u32,
    code_size: u32,
    stack_size_in_bytes: u32,
    num_vgprs: u32,
    num_sgprs: u32,
    _reserved: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<BinaryHeader>();
const SHADER_RECORD_SIZE: usize = std::mem::size_of::<RawShaderRecord>();
const SYMBOL_SIZE: usize = std::mem::size_of::<RawSymbol>();

#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryKind {
    Compute,
    Graphics,
    Library,
}

impl BinaryKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(BinaryKind::Compute),
            1 => Some(BinaryKind::Graphics),
            2 => Some(BinaryKind::Library),
            _ => None,
        }
    }

    fn raw(self) -> u32 {
        match self {
            BinaryKind::Compute => 0,
            BinaryKind::Graphics => 1,
            BinaryKind::Library => 2,
        }
    }
}

/// One hardware shader, possibly serving several merged API stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderRecord {
    pub api_stages: ApiShaderStageFlags,
    pub hw_stage: HardwareStage,
    pub hash: ShaderHash,
    pub pal_hash: ShaderHash,
    pub common: CommonShaderStats,
    pub num_available_vgprs: u32,
    pub num_available_sgprs: u32,
    pub operations: ShaderOperations,
    pub cs: ComputeShaderStats,
    pub copy_shader: Option<CommonShaderStats>,
    /// Byte range inside [`PipelineBinary::code`].
    pub isa: Range<usize>,
    /// Byte range inside [`PipelineBinary::perf_data`].
    pub perf_data: Range<usize>,
}

/// A callable function exported by the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    pub name: String,
    /// Offset inside [`PipelineBinary::code`].
    pub code_offset: u32,
    pub code_size: u32,
    pub stack_size_in_bytes: u32,
    pub num_vgprs: u32,
    pub num_sgprs: u32,
}

/// Parsed, owned form of a pipeline or library binary.
#[derive(Debug, Clone)]
pub struct PipelineBinary {
    pub kind: BinaryKind,
    pub abi_major: u16,
    pub abi_minor: u16,
    pub wavefront_size: u32,
    pub pipeline_hash: PipelineHash,
    pub user_data_layout_hash: u64,
    pub stack_size_in_bytes: u32,
    pub per_sample_shading: bool,
    pub shaders: Vec<ShaderRecord>,
    pub symbols: Vec<SymbolRecord>,
    pub data: Vec<u8>,
    pub code: Vec<u8>,
    pub perf_data: Vec<u8>,
}

fn read<T: Pod>(bytes: &[u8], offset: usize) -> Result<T> {
    let end = offset
        .checked_add(std::mem::size_of::<T>())
        .ok_or(PalError::BadPipelineData("record offset overflows"))?;
    let slice = bytes
        .get(offset..end)
        .ok_or(PalError::BadPipelineData("record out of bounds"))?;
    bytemuck::try_pod_read_unaligned(slice)
        .map_err(|_| PalError::BadPipelineData("record out of bounds"))
}

fn section<'a>(bytes: &'a [u8], range: &SectionRange, what: &'static str) -> Result<&'a [u8]> {
    let end = range.offset.checked_add(range.size).ok_or(PalError::BadPipelineData(what))?;
    bytes
        .get(range.offset as usize..end as usize)
        .ok_or(PalError::BadPipelineData(what))
}

fn within(outer_len: usize, range: &SectionRange) -> bool {
    range
        .offset
        .checked_add(range.size)
        .map_or(false, |end| end as usize <= outer_len)
}

impl PipelineBinary {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header: BinaryHeader = read(bytes, 0)?;

        if header.magic != MAGIC {
            return Err(PalError::BadPipelineData("bad magic"));
        }
        if header.abi_major != ABI_MAJOR_VERSION {
            return Err(PalError::BadPipelineData("unsupported ABI major version"));
        }
        let kind = BinaryKind::from_raw(header.kind)
            .ok_or(PalError::BadPipelineData("unknown binary kind"))?;
        if header.wavefront_size != 32 && header.wavefront_size != 64 {
            return Err(PalError::BadPipelineData("unsupported wavefront size"));
        }

        let records_end = (header.shader_count as usize)
            .checked_mul(SHADER_RECORD_SIZE)
            .and_then(|s| s.checked_add(HEADER_SIZE))
            .and_then(|s| {
                (header.symbol_count as usize)
                    .checked_mul(SYMBOL_SIZE)
                    .and_then(|y| y.checked_add(s))
            })
            .ok_or(PalError::BadPipelineData("record table too large"))?;
        if records_end > bytes.len() {
            return Err(PalError::BadPipelineData("record table out of bounds"));
        }

        let strings = section(bytes, &header.string_table, "string table out of bounds")?;
        let data = section(bytes, &header.data, "data section out of bounds")?;
        let code = section(bytes, &header.code, "code section out of bounds")?;
        let perf_data = section(bytes, &header.perf_data, "perf data section out of bounds")?;

        let mut shaders = Vec::with_capacity(header.shader_count as usize);
        let mut claimed = ApiShaderStageFlags::empty();
        for i in 0..header.shader_count as usize {
            let raw: RawShaderRecord = read(bytes, HEADER_SIZE + i * SHADER_RECORD_SIZE)?;

            let api_stages = ApiShaderStageFlags::from_bits(raw.api_stage_mask)
                .filter(|mask| !mask.is_empty())
                .ok_or(PalError::BadPipelineData("invalid API stage mask"))?;
            if claimed.intersects(api_stages) {
                return Err(PalError::BadPipelineData("API stage defined twice"));
            }
            claimed |= api_stages;

            let hw_stage = HardwareStage::from_raw(raw.hardware_stage)
                .ok_or(PalError::BadPipelineData("invalid hardware stage"))?;
            if !within(code.len(), &raw.isa) {
                return Err(PalError::BadPipelineData("shader ISA out of bounds"));
            }
            if !within(perf_data.len(), &raw.perf_data) {
                return Err(PalError::BadPipelineData("performance data out of bounds"));
            }

            shaders.push(ShaderRecord {
                api_stages,
                hw_stage,
                hash: ShaderHash {
                    lower: raw.hash_lower,
                    upper: raw.hash_upper,
                },
                pal_hash: ShaderHash {
                    lower: raw.pal_hash_lower,
                    upper: raw.pal_hash_upper,
                },
                common: raw.common.into(),
                num_available_vgprs: raw.num_available_vgprs,
                num_available_sgprs: raw.num_available_sgprs,
                operations: ShaderOperations::from_bits_truncate(raw.operations),
                cs: ComputeShaderStats {
                    num_threads_per_group_x: raw.threads_x,
                    num_threads_per_group_y: raw.threads_y,
                    num_threads_per_group_z: raw.threads_z,
                },
                copy_shader: (raw.flags & SHADER_FLAG_COPY_SHADER_PRESENT != 0)
                    .then(|| raw.copy_shader.into()),
                isa: raw.isa.range(),
                perf_data: raw.perf_data.range(),
            });
        }

        let symbol_base = HEADER_SIZE + header.shader_count as usize * SHADER_RECORD_SIZE;
        let mut symbols = Vec::with_capacity(header.symbol_count as usize);
        for i in 0..header.symbol_count as usize {
            let raw: RawSymbol = read(bytes, symbol_base + i * SYMBOL_SIZE)?;
            let name_bytes = section(strings, &raw.name, "symbol name out of bounds")?;
            let name = std::str::from_utf8(name_bytes)
                .map_err(|_| PalError::BadPipelineData("symbol name is not UTF-8"))?;
            if name.is_empty() {
                return Err(PalError::BadPipelineData("empty symbol name"));
            }
            let code_range = SectionRange {
                offset: raw.code_offset,
                size: raw.code_size,
            };
            if !within(code.len(), &code_range) {
                return Err(PalError::BadPipelineData("symbol code out of bounds"));
            }
            symbols.push(SymbolRecord {
                name: name.to_owned(),
                code_offset: raw.code_offset,
                code_size: raw.code_size,
                stack_size_in_bytes: raw.stack_size_in_bytes,
                num_vgprs: raw.num_vgprs,
                num_sgprs: raw.num_sgprs,
            });
        }

        match kind {
            BinaryKind::Compute => {
                if shaders.len() != 1 || shaders[0].api_stages != ApiShaderStageFlags::COMPUTE {
                    return Err(PalError::BadPipelineData(
                        "compute binary must hold exactly one compute shader",
                    ));
                }
            }
            BinaryKind::Graphics => {
                if shaders.is_empty() || claimed.contains(ApiShaderStageFlags::COMPUTE) {
                    return Err(PalError::BadPipelineData(
                        "graphics binary must hold only graphics shaders",
                    ));
                }
            }
            BinaryKind::Library => {
                if !shaders.is_empty() {
                    return Err(PalError::BadPipelineData("library binary holds shaders"));
                }
            }
        }

        Ok(Self {
            kind,
            abi_major: header.abi_major,
            abi_minor: header.abi_minor,
            wavefront_size: header.wavefront_size,
            pipeline_hash: PipelineHash {
                stable: header.pipeline_hash_stable,
                unique: header.pipeline_hash_unique,
            },
            user_data_layout_hash: header.user_data_layout_hash,
            stack_size_in_bytes: header.stack_size_in_bytes,
            per_sample_shading: header.flags & HEADER_FLAG_PER_SAMPLE_SHADING != 0,
            shaders,
            symbols,
            data: data.to_vec(),
            code: code.to_vec(),
            perf_data: perf_data.to_vec(),
        })
    }

    pub fn isa(&self, shader: &ShaderRecord) -> &[u8] {
        &self.code[shader.isa.clone()]
    }

    pub fn shader_perf_data(&self, shader: &ShaderRecord) -> &[u8] {
        &self.perf_data[shader.perf_data.clone()]
    }
}

/// Input for one shader record of [`PipelineBinaryBuilder`].
#[derive(Debug, Clone)]
pub struct ShaderDesc {
    pub api_stages: ApiShaderStageFlags,
    pub hw_stage: HardwareStage,
    pub hash: ShaderHash,
    pub pal_hash: ShaderHash,
    pub common: CommonShaderStats,
    pub num_available_vgprs: u32,
    pub num_available_sgprs: u32,
    pub operations: ShaderOperations,
    pub cs: ComputeShaderStats,
    pub copy_shader: Option<CommonShaderStats>,
    pub isa: Vec<u8>,
    pub perf_data: Vec<u8>,
}

impl ShaderDesc {
    pub fn new(api_stages: ApiShaderStageFlags, hw_stage: HardwareStage) -> Self {
        Self {
            api_stages,
            hw_stage,
            hash: ShaderHash::default(),
            pal_hash: ShaderHash::default(),
            common: CommonShaderStats::default(),
            num_available_vgprs: 256,
            num_available_sgprs: 104,
            operations: ShaderOperations::empty(),
            cs: ComputeShaderStats::default(),
            copy_shader: None,
            isa: Vec::new(),
            perf_data: Vec::new(),
        }
    }
}

/// Input for one exported function of [`PipelineBinaryBuilder`].
#[derive(Debug, Clone, Default)]
pub struct SymbolDesc {
    pub name: String,
    pub code: Vec<u8>,
    pub stack_size_in_bytes: u32,
    pub num_vgprs: u32,
    pub num_sgprs: u32,
}

/// Assembles pipeline and library binaries.
#[derive(Debug, Clone)]
pub struct PipelineBinaryBuilder {
    kind: BinaryKind,
    abi_major: u16,
    wavefront_size: u32,
    pipeline_hash: PipelineHash,
    user_data_layout_hash: u64,
    stack_size_in_bytes: u32,
    per_sample_shading: bool,
    shaders: Vec<ShaderDesc>,
    symbols: Vec<SymbolDesc>,
    data: Vec<u8>,
}

impl PipelineBinaryBuilder {
    pub fn new(kind: BinaryKind) -> Self {
        Self {
            kind,
            abi_major: ABI_MAJOR_VERSION,
            wavefront_size: 64,
            pipeline_hash: PipelineHash::default(),
            user_data_layout_hash: 0,
            stack_size_in_bytes: 0,
            per_sample_shading: false,
            shaders: Vec::new(),
            symbols: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn abi_major(mut self, major: u16) -> Self {
        self.abi_major = major;
        self
    }

    pub fn wavefront_size(mut self, size: u32) -> Self {
        self.wavefront_size = size;
        self
    }

    pub fn pipeline_hash(mut self, stable: u64, unique: u64) -> Self {
        self.pipeline_hash = PipelineHash { stable, unique };
        self
    }

    pub fn user_data_layout_hash(mut self, hash: u64) -> Self {
        self.user_data_layout_hash = hash;
        self
    }

    pub fn stack_size_in_bytes(mut self, size: u32) -> Self {
        self.stack_size_in_bytes = size;
        self
    }

    pub fn per_sample_shading(mut self, enable: bool) -> Self {
        self.per_sample_shading = enable;
        self
    }

    pub fn data(mut self, data: &[u8]) -> Self {
        self.data = data.to_vec();
        self
    }

    pub fn shader(mut self, shader: ShaderDesc) -> Self {
        self.shaders.push(shader);
        self
    }

    pub fn symbol(mut self, symbol: SymbolDesc) -> Self {
        self.symbols.push(symbol);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut strings = Vec::new();
        let mut code = Vec::new();
        let mut perf = Vec::new();

        let mut raw_shaders = Vec::with_capacity(self.shaders.len());
        for shader in &self.shaders {
            let isa = SectionRange {
                offset: code.len() as u32,
                size: shader.isa.len() as u32,
            };
            code.extend_from_slice(&shader.isa);
            let perf_data = SectionRange {
                offset: perf.len() as u32,
                size: shader.perf_data.len() as u32,
            };
            perf.extend_from_slice(&shader.perf_data);

            raw_shaders.push(RawShaderRecord {
                api_stage_mask: shader.api_stages.bits(),
                hardware_stage: shader.hw_stage as u32,
                hash_lower: shader.hash.lower,
                hash_upper: shader.hash.upper,
                pal_hash_lower: shader.pal_hash.lower,
                pal_hash_upper: shader.pal_hash.upper,
                common: shader.common.into(),
                num_available_vgprs: shader.num_available_vgprs,
                num_available_sgprs: shader.num_available_sgprs,
                operations: shader.operations.bits(),
                threads_x: shader.cs.num_threads_per_group_x,
                threads_y: shader.cs.num_threads_per_group_y,
                threads_z: shader.cs.num_threads_per_group_z,
                flags: if shader.copy_shader.is_some() {
                    SHADER_FLAG_COPY_SHADER_PRESENT
                } else {
                    0
                },
                copy_shader: shader.copy_shader.unwrap_or_default().into(),
                isa,
                perf_data,
                _reserved: 0,
            });
        }

        let mut raw_symbols = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            let name = SectionRange {
                offset: strings.len() as u32,
                size: symbol.name.len() as u32,
            };
            strings.extend_from_slice(symbol.name.as_bytes());
            let code_offset = code.len() as u32;
            code.extend_from_slice(&symbol.code);
            raw_symbols.push(RawSymbol {
                name,
                code_offset,
                code_size: symbol.code.len() as u32,
                stack_size_in_bytes: symbol.stack_size_in_bytes,
                num_vgprs: symbol.num_vgprs,
                num_sgprs: symbol.num_sgprs,
                _reserved: 0,
            });
        }

        let mut offset =
            HEADER_SIZE + raw_shaders.len() * SHADER_RECORD_SIZE + raw_symbols.len() * SYMBOL_SIZE;
        let mut place = |len: usize| {
            let range = SectionRange {
                offset: offset as u32,
                size: len as u32,
            };
            offset += len;
            range
        };
        let string_table = place(strings.len());
        let data = place(self.data.len());
        let code_range = place(code.len());
        let perf_range = place(perf.len());

        let header = BinaryHeader {
            magic: MAGIC,
            abi_major: self.abi_major,
            abi_minor: ABI_MINOR_VERSION,
            kind: self.kind.raw(),
            wavefront_size: self.wavefront_size,
            pipeline_hash_stable: self.pipeline_hash.stable,
            pipeline_hash_unique: self.pipeline_hash.unique,
            user_data_layout_hash: self.user_data_layout_hash,
            stack_size_in_bytes: self.stack_size_in_bytes,
            shader_count: raw_shaders.len() as u32,
            symbol_count: raw_symbols.len() as u32,
            flags: if self.per_sample_shading {
                HEADER_FLAG_PER_SAMPLE_SHADING
            } else {
                0
            },
            string_table,
            data,
            code: code_range,
            perf_data: perf_range,
        };

        let mut out = Vec::with_capacity(offset);
        out.extend_from_slice(bytemuck::bytes_of(&header));
        for raw in &raw_shaders {
            out.extend_from_slice(bytemuck::bytes_of(raw));
        }
        for raw in &raw_symbols {
            out.extend_from_slice(bytemuck::bytes_of(raw));
        }
        out.extend_from_slice(&strings);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&code);
        out.extend_from_slice(&perf);
        out
    }
}
