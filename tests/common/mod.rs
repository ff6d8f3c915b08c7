#![allow(dead_code)]

use std::sync::Arc;

use palcore::pipeline::binary::{BinaryKind, PipelineBinaryBuilder, ShaderDesc, SymbolDesc};
use palcore::{
    ApiShaderStageFlags, CommonShaderStats, ComputePipelineCreateInfo, Context,
    GraphicsPipelineCreateInfo, HardwareStage, Handle, NullMemoryManager, Pipeline,
    ShaderHash, Settings,
};

pub const USER_DATA_HASH: u64 = 0xABCD_0123;

/// s_endpgm, v_mov_b32, s_nop
pub const CS_ISA: [u8; 12] = [
    0x00, 0x00, 0x81, 0xBF, 0x80, 0x02, 0x00, 0x7E, 0x00, 0x00, 0x80, 0xBF,
];

/// Context over a host-backed memory manager. Dropping it destroys the
/// context and checks that every allocation was returned.
pub struct TestContext {
    ctx: Option<Context>,
    mem: Arc<NullMemoryManager>,
}

impl TestContext {
    pub fn new(settings: Settings) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mem = Arc::new(NullMemoryManager::new());
        Self {
            ctx: Some(Context::new(mem.clone(), settings)),
            mem,
        }
    }

    pub fn headless() -> Self {
        Self::new(Settings::default())
    }

    pub fn mem(&self) -> &NullMemoryManager {
        &self.mem
    }

    pub fn compute(&mut self, binary: &[u8]) -> Handle<Pipeline> {
        self.make_compute_pipeline(&ComputePipelineCreateInfo {
            pipeline_binary: binary,
            ..Default::default()
        })
        .expect("compute pipeline should be created")
    }

    pub fn graphics(&mut self, binary: &[u8]) -> Handle<Pipeline> {
        self.make_graphics_pipeline(&GraphicsPipelineCreateInfo {
            pipeline_binary: binary,
            ..Default::default()
        })
        .expect("graphics pipeline should be created")
    }
}

impl std::ops::Deref for TestContext {
    type Target = Context;

    fn deref(&self) -> &Self::Target {
        self.ctx.as_ref().expect("context should be present")
    }
}

impl std::ops::DerefMut for TestContext {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx.as_mut().expect("context should be present")
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.destroy();
            if !std::thread::panicking() {
                assert_eq!(
                    self.mem.live_allocations(),
                    0,
                    "GPU memory leaked past context destruction"
                );
            }
        }
    }
}

pub fn compute_shader() -> ShaderDesc {
    let mut cs = ShaderDesc::new(ApiShaderStageFlags::COMPUTE, HardwareStage::Cs);
    cs.hash = ShaderHash {
        lower: 0xC0FFEE,
        upper: 0x1,
    };
    cs.common = CommonShaderStats {
        num_used_vgprs: 24,
        num_used_sgprs: 16,
        ..Default::default()
    };
    cs.cs.num_threads_per_group_x = 64;
    cs.cs.num_threads_per_group_y = 1;
    cs.cs.num_threads_per_group_z = 1;
    cs.isa = CS_ISA.to_vec();
    cs.perf_data = vec![0xAA; 16];
    cs
}

/// Compute binary with code, data and perf sections: three allocations.
pub fn compute_builder() -> PipelineBinaryBuilder {
    PipelineBinaryBuilder::new(BinaryKind::Compute)
        .pipeline_hash(0x1111, 0x2222)
        .user_data_layout_hash(USER_DATA_HASH)
        .stack_size_in_bytes(256)
        .data(&[0x5A; 32])
        .shader(compute_shader())
}

pub fn compute_binary() -> Vec<u8> {
    compute_builder().build()
}

/// Vertex and hull merged onto HS, geometry on GS, pixel on PS.
pub fn graphics_binary() -> Vec<u8> {
    let mut hs = ShaderDesc::new(
        ApiShaderStageFlags::VERTEX | ApiShaderStageFlags::HULL,
        HardwareStage::Hs,
    );
    hs.hash = ShaderHash { lower: 1, upper: 2 };
    hs.common.num_used_vgprs = 32;
    hs.isa = vec![0u8; 8];

    let mut gs = ShaderDesc::new(ApiShaderStageFlags::GEOMETRY, HardwareStage::Gs);
    gs.hash = ShaderHash { lower: 3, upper: 4 };
    gs.copy_shader = Some(CommonShaderStats {
        num_used_vgprs: 8,
        ..Default::default()
    });
    gs.isa = vec![0u8; 4];

    let mut ps = ShaderDesc::new(ApiShaderStageFlags::PIXEL, HardwareStage::Ps);
    ps.hash = ShaderHash { lower: 5, upper: 6 };
    ps.isa = vec![0u8; 4];
    ps.perf_data = vec![1, 2, 3, 4];

    PipelineBinaryBuilder::new(BinaryKind::Graphics)
        .pipeline_hash(0x3333, 0x4444)
        .user_data_layout_hash(USER_DATA_HASH)
        .per_sample_shading(true)
        .shader(hs)
        .shader(gs)
        .shader(ps)
        .build()
}

pub fn library_builder() -> PipelineBinaryBuilder {
    PipelineBinaryBuilder::new(BinaryKind::Library).user_data_layout_hash(USER_DATA_HASH)
}

pub fn function(name: &str, stack_size_in_bytes: u32) -> SymbolDesc {
    SymbolDesc {
        name: name.into(),
        code: vec![0u8; 16],
        stack_size_in_bytes,
        num_vgprs: 16,
        num_sgprs: 8,
    }
}
