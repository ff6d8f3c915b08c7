mod common;

use std::sync::Arc;

use common::*;
use palcore::pipeline::isa;
use palcore::*;

#[test]
fn allocation_info_follows_two_call_convention() {
    let mut ctx = TestContext::headless();
    let binary = compute_binary();
    let handle = ctx.compute(&binary);
    let pipeline = ctx.pipeline(handle).unwrap();

    let mut count = 42;
    pipeline.query_allocation_info(Some(&mut count), None).unwrap();
    assert_eq!(count, 3);

    let mut list = [GpuMemSubAllocInfo::default(); 5];
    let mut too_many = 5;
    assert_eq!(
        pipeline.query_allocation_info(Some(&mut too_many), Some(&mut list)),
        Err(PalError::InvalidValue)
    );
    assert_eq!(list, [GpuMemSubAllocInfo::default(); 5]);

    let mut exact = 3;
    pipeline
        .query_allocation_info(Some(&mut exact), Some(&mut list[..3]))
        .unwrap();
    let sizes: Vec<u64> = list[..3].iter().map(|a| a.size).collect();
    assert_eq!(sizes, vec![12, 32, 16]);
    for alloc in &list[..3] {
        let info = ctx.mem().allocation_info(alloc.gpu_memory).unwrap();
        assert!(info.flags.contains(GpuMemoryInternalFlags::PIPELINE_CODE));
        assert_eq!(info.heap, GpuHeap::Invisible);
    }

    assert_eq!(
        pipeline.query_allocation_info(None, None),
        Err(PalError::InvalidPointer)
    );
}

#[test]
fn code_object_is_reproduced_byte_for_byte() {
    let mut ctx = TestContext::headless();
    let binary = compute_binary();
    let handle = ctx.compute(&binary);
    let pipeline = ctx.pipeline(handle).unwrap();

    let mut size = 0;
    pipeline.code_object(&mut size, None).unwrap();
    assert_eq!(size, binary.len());

    let mut out = vec![0u8; size];
    pipeline.code_object(&mut size, Some(&mut out)).unwrap();
    assert_eq!(out, binary);

    let mut short = size - 1;
    assert_eq!(
        pipeline.code_object(&mut short, Some(&mut out)),
        Err(PalError::InvalidValue)
    );
}

#[test]
fn code_object_is_unavailable_when_not_retained() {
    let mut ctx = TestContext::new(Settings::default().with_retain_code_object(false));
    let binary = compute_binary();
    let handle = ctx.compute(&binary);

    let mut size = 0;
    assert_eq!(
        ctx.pipeline(handle).unwrap().code_object(&mut size, None),
        Err(PalError::Unavailable)
    );
}

#[test]
fn shader_code_and_performance_data() {
    let mut ctx = TestContext::headless();
    let binary = compute_binary();
    let handle = ctx.compute(&binary);
    let pipeline = ctx.pipeline(handle).unwrap();

    let mut size = 0;
    pipeline.shader_code(ShaderType::Compute, &mut size, None).unwrap();
    assert_eq!(size, CS_ISA.len());
    let mut isa_out = vec![0u8; size];
    pipeline
        .shader_code(ShaderType::Compute, &mut size, Some(&mut isa_out))
        .unwrap();
    assert_eq!(isa_out, CS_ISA);

    assert_eq!(
        pipeline.shader_code(ShaderType::Pixel, &mut size, None),
        Err(PalError::Unavailable)
    );

    let mut perf_size = 0;
    pipeline
        .performance_data(HardwareStage::Cs, &mut perf_size, None)
        .unwrap();
    assert_eq!(perf_size, 16);
    let mut perf = vec![0u8; perf_size];
    pipeline
        .performance_data(HardwareStage::Cs, &mut perf_size, Some(&mut perf))
        .unwrap();
    assert_eq!(perf, vec![0xAA; 16]);

    assert_eq!(
        pipeline.performance_data(HardwareStage::Ps, &mut perf_size, None),
        Err(PalError::Unavailable)
    );
}

#[test]
fn shader_stats_of_absent_stage_is_unavailable() {
    let mut ctx = TestContext::headless();
    let binary = compute_binary();
    let handle = ctx.compute(&binary);
    let pipeline = ctx.pipeline(handle).unwrap();

    assert_eq!(
        pipeline.shader_stats(ShaderType::Vertex, true),
        Err(PalError::Unavailable)
    );

    let stats = pipeline.shader_stats(ShaderType::Compute, false).unwrap();
    assert_eq!(stats.shader_stage_mask, ApiShaderStageFlags::COMPUTE);
    assert_eq!(stats.isa_size_in_bytes, 0);
    assert_eq!(stats.common.num_used_vgprs, 24);
    assert_eq!(stats.cs.num_threads_per_group_x, 64);
    assert!(stats.copy_shader.is_none());

    let with_disassembly = pipeline.shader_stats(ShaderType::Compute, true).unwrap();
    assert_eq!(
        with_disassembly.isa_size_in_bytes,
        isa::disassemble(&CS_ISA).unwrap().len()
    );
}

#[test]
fn misaligned_isa_cannot_be_disassembled() {
    let mut cs = compute_shader();
    cs.isa = vec![0u8; 6];
    let binary = compute_builder().build();
    let binary_bad = palcore::pipeline::binary::PipelineBinaryBuilder::new(
        palcore::pipeline::binary::BinaryKind::Compute,
    )
    .pipeline_hash(1, 2)
    .shader(cs)
    .build();

    let mut ctx = TestContext::headless();
    let good = ctx.compute(&binary);
    let bad = ctx.compute(&binary_bad);

    assert!(ctx.pipeline(good).unwrap().shader_stats(ShaderType::Compute, true).is_ok());
    let bad = ctx.pipeline(bad).unwrap();
    assert_eq!(
        bad.shader_stats(ShaderType::Compute, true),
        Err(PalError::Unavailable)
    );
    assert!(bad.shader_stats(ShaderType::Compute, false).is_ok());
}

#[test]
fn merged_stages_share_stats_and_hardware_stage() {
    let mut ctx = TestContext::headless();
    let binary = graphics_binary();
    let handle = ctx.graphics(&binary);
    let pipeline = ctx.pipeline(handle).unwrap();

    let vs = pipeline.shader_stats(ShaderType::Vertex, false).unwrap();
    let hs = pipeline.shader_stats(ShaderType::Hull, false).unwrap();
    assert_eq!(vs, hs);
    assert_eq!(
        vs.shader_stage_mask,
        ApiShaderStageFlags::VERTEX | ApiShaderStageFlags::HULL
    );

    let mapping = pipeline.api_hw_shader_mapping();
    assert_eq!(mapping.hw_stages(ShaderType::Vertex), HardwareStageFlags::HS);
    assert_eq!(mapping.hw_stages(ShaderType::Hull), HardwareStageFlags::HS);
    assert_eq!(mapping.hw_stages(ShaderType::Geometry), HardwareStageFlags::GS);
    assert!(mapping.hw_stages(ShaderType::Domain).is_empty());

    let gs = pipeline.shader_stats(ShaderType::Geometry, false).unwrap();
    assert_eq!(gs.copy_shader.map(|c| c.num_used_vgprs), Some(8));
    assert_eq!(
        pipeline.shader_stats(ShaderType::Domain, false),
        Err(PalError::Unavailable)
    );
}

#[test]
fn info_reports_hashes_per_stage() {
    let mut ctx = TestContext::headless();
    let binary = graphics_binary();
    let handle = ctx.graphics(&binary);
    let info = *ctx.pipeline(handle).unwrap().info();

    assert_eq!(info.internal_pipeline_hash.stable, 0x3333);
    assert_eq!(info.internal_pipeline_hash.unique, 0x4444);
    assert_eq!(info.shader[ShaderType::Vertex.index()], ShaderHash { lower: 1, upper: 2 });
    assert_eq!(info.shader[ShaderType::Hull.index()], ShaderHash { lower: 1, upper: 2 });
    assert_eq!(info.shader[ShaderType::Pixel.index()], ShaderHash { lower: 5, upper: 6 });
    assert!(info.shader[ShaderType::Domain.index()].is_zero());
    assert!(info.shader[ShaderType::Compute.index()].is_zero());
    assert!(info.ps.per_sample_shading);
}

#[test]
fn override_heap_flag_selects_preferred_heap() {
    let mut ctx = TestContext::headless();
    let binary = compute_binary();
    let handle = ctx
        .make_compute_pipeline(&ComputePipelineCreateInfo {
            flags: PipelineCreateFlags::OVERRIDE_GPU_HEAP,
            pipeline_binary: &binary,
            preferred_heap: GpuHeap::GartCacheable,
            ..Default::default()
        })
        .unwrap();

    let mut count = 3;
    let mut list = [GpuMemSubAllocInfo::default(); 3];
    ctx.pipeline(handle)
        .unwrap()
        .query_allocation_info(Some(&mut count), Some(&mut list))
        .unwrap();
    for alloc in &list {
        assert_eq!(
            ctx.mem().allocation_info(alloc.gpu_memory).unwrap().heap,
            GpuHeap::GartCacheable
        );
    }
}

#[test]
fn malformed_or_mismatched_binaries_are_rejected() {
    let mut ctx = TestContext::headless();

    let graphics = graphics_binary();
    assert!(matches!(
        ctx.make_compute_pipeline(&ComputePipelineCreateInfo {
            pipeline_binary: &graphics,
            ..Default::default()
        }),
        Err(PalError::BadPipelineData(_))
    ));

    let unhashed = compute_builder().pipeline_hash(0, 0).build();
    assert!(matches!(
        ctx.make_compute_pipeline(&ComputePipelineCreateInfo {
            pipeline_binary: &unhashed,
            ..Default::default()
        }),
        Err(PalError::BadPipelineData(_))
    ));

    assert!(matches!(
        ctx.make_compute_pipeline(&ComputePipelineCreateInfo {
            pipeline_binary: &[0u8; 16],
            ..Default::default()
        }),
        Err(PalError::BadPipelineData(_))
    ));
    assert_eq!(ctx.mem().alloc_count(), 0);
    assert_eq!(ctx.live_pipelines(), 0);
}

#[test]
fn unhashed_binary_accepted_without_validation() {
    let mut ctx = TestContext::new(Settings::default().with_validate_hashes(false));
    let unhashed = compute_builder().pipeline_hash(0, 0).build();
    let handle = ctx.compute(&unhashed);
    assert_eq!(
        ctx.pipeline(handle).unwrap().info().internal_pipeline_hash,
        PipelineHash::default()
    );
}

#[test]
fn graphics_create_info_is_validated() {
    let mut ctx = TestContext::headless();
    let binary = graphics_binary();

    let mut info = GraphicsPipelineCreateInfo {
        pipeline_binary: &binary,
        ..Default::default()
    };
    info.view_instancing_desc.view_instance_count = 7;
    assert_eq!(
        ctx.make_graphics_pipeline(&info).err(),
        Some(PalError::InvalidValue)
    );

    info.view_instancing_desc.view_instance_count = 2;
    info.coverage_out_desc = MsaaCoverageOutDescriptor {
        enable: true,
        num_samples: 4,
        mrt: 8,
        channel: 0,
    };
    assert_eq!(
        ctx.make_graphics_pipeline(&info).err(),
        Some(PalError::InvalidValue)
    );

    info.coverage_out_desc.mrt = 1;
    info.use_late_alloc_vs_limit = true;
    info.late_alloc_vs_limit = 12;
    let handle = ctx.make_graphics_pipeline(&info).unwrap();
    match ctx.pipeline(handle).unwrap().kind() {
        PipelineKind::Graphics(state) => {
            assert_eq!(state.late_alloc_vs_limit, Some(12));
            assert_eq!(state.view_instancing_desc.view_instance_count, 2);
        }
        PipelineKind::Compute(_) => panic!("expected a graphics pipeline"),
    }
}

#[test]
fn client_data_is_opaque() {
    let mut ctx = TestContext::headless();
    let binary = compute_binary();
    let handle = ctx.compute(&binary);

    assert!(ctx.pipeline(handle).unwrap().client_data().is_none());
    ctx.pipeline_mut(handle)
        .unwrap()
        .set_client_data(Some(Arc::new(String::from("layer"))));

    let data = ctx.pipeline(handle).unwrap().client_data().cloned().unwrap();
    assert_eq!(data.downcast_ref::<String>().map(String::as_str), Some("layer"));
}

#[test]
fn destroyed_pipeline_handle_goes_stale() {
    let mut ctx = TestContext::headless();
    let binary = compute_binary();
    let first = ctx.compute(&binary);
    ctx.destroy_pipeline(first).unwrap();
    assert_eq!(ctx.mem().live_allocations(), 0);
    assert_eq!(ctx.mem().free_count(), 3);

    let second = ctx.compute(&binary);
    assert_eq!(first.slot, second.slot);
    assert!(matches!(ctx.pipeline(first), Err(PalError::StaleHandle)));
    assert!(ctx.pipeline(second).is_ok());
    assert_eq!(ctx.destroy_pipeline(first), Err(PalError::StaleHandle));
}
