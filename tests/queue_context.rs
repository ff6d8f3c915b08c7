use std::sync::Arc;

use palcore::*;

fn read_u32(mm: &NullMemoryManager, binding: &BoundGpuMemory) -> u32 {
    let bytes = mm
        .read_bytes(binding.memory().unwrap(), binding.offset(), 4)
        .unwrap();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[test]
fn timestamp_memory_layout_and_zeroing() {
    for base_offset in [0u64, 64] {
        for need_wait_for_idle in [true, false] {
            let mm = Arc::new(NullMemoryManager::with_base_offset(base_offset));
            let mut qc = BaseQueueContext::new(mm.clone());
            assert_eq!(qc.state(), QueueContextState::Uninitialized);

            qc.create_timestamp_mem(need_wait_for_idle).unwrap();
            assert_eq!(qc.state(), QueueContextState::TimestampReady);

            let ts = qc.timestamps();
            let exclusive = ts.exclusive_exec_ts();
            assert!(exclusive.is_bound());
            assert_eq!(exclusive.offset(), base_offset);
            assert_eq!(read_u32(&mm, exclusive), 0);

            let info = mm.allocation_info(exclusive.memory().unwrap()).unwrap();
            assert_eq!(info.size, if need_wait_for_idle { 8 } else { 4 });
            assert_eq!(info.heap, GpuHeap::Local);
            assert_eq!(info.flags, GpuMemoryInternalFlags::ALWAYS_RESIDENT);
            assert_eq!(info.request.alignment, 4);
            assert_eq!(info.request.heaps(), &[GpuHeap::Local, GpuHeap::GartUswc]);
            assert_eq!(info.request.priority, GpuMemPriority::Normal);
            assert_eq!(info.request.va_range, VaRange::Default);

            let wait_for_idle = ts.wait_for_idle_ts();
            if need_wait_for_idle {
                assert!(wait_for_idle.is_bound());
                assert_eq!(wait_for_idle.memory(), exclusive.memory());
                assert_eq!(wait_for_idle.offset(), base_offset + 4);
                assert_eq!(read_u32(&mm, wait_for_idle), 0);
            } else {
                assert!(!wait_for_idle.is_bound());
                assert_eq!(ts.read_wait_for_idle(), Err(PalError::Unavailable));
            }
            assert_eq!(mm.alloc_count(), 1);
        }
    }
}

#[test]
fn destruction_frees_exactly_one_allocation() {
    for need_wait_for_idle in [true, false] {
        let mm = Arc::new(NullMemoryManager::new());
        let mut qc = BaseQueueContext::new(mm.clone());
        qc.create_timestamp_mem(need_wait_for_idle).unwrap();
        assert_eq!(mm.live_allocations(), 1);

        drop(qc);
        assert_eq!(mm.free_count(), 1);
        assert_eq!(mm.live_allocations(), 0);
    }
}

#[test]
fn second_creation_is_rejected_without_leaking() {
    let mm = Arc::new(NullMemoryManager::new());
    let mut qc = BaseQueueContext::new(mm.clone());
    qc.create_timestamp_mem(false).unwrap();
    let first = *qc.timestamps().exclusive_exec_ts();

    assert_eq!(qc.create_timestamp_mem(true), Err(PalError::Unavailable));
    assert_eq!(mm.alloc_count(), 1);
    assert_eq!(*qc.timestamps().exclusive_exec_ts(), first);
    assert!(!qc.timestamps().wait_for_idle_ts().is_bound());

    drop(qc);
    assert_eq!(mm.live_allocations(), 0);
}

#[test]
fn uninitialized_context_frees_nothing() {
    let mm = Arc::new(NullMemoryManager::new());
    drop(BaseQueueContext::new(mm.clone()));
    assert_eq!(mm.free_count(), 0);
}

#[test]
fn base_pre_process_submit_adds_nothing() {
    let mm = Arc::new(NullMemoryManager::new());
    mm.set_paging_fence(99);
    let mut qc = BaseQueueContext::new(mm.clone());
    let refs = [GpuMemory::new(3, 1), GpuMemory::new(4, 0)];

    for submit in [
        SubmitInfo::default(),
        SubmitInfo {
            cmd_stream_count: 17,
            gpu_mem_refs: &refs,
        },
    ] {
        assert_eq!(
            qc.pre_process_submit(&submit),
            Ok(InternalSubmitInfo::default())
        );
    }

    qc.create_timestamp_mem(true).unwrap();
    let out = qc
        .pre_process_submit(&SubmitInfo {
            cmd_stream_count: 1,
            gpu_mem_refs: &refs,
        })
        .unwrap();
    assert_eq!(out.num_preamble_cmd_streams, 0);
    assert_eq!(out.num_postamble_cmd_streams, 0);
    assert_eq!(out.paging_fence, 0);
}

#[test]
fn allocation_failure_propagates_without_binding() {
    let mm = Arc::new(NullMemoryManager::new());
    mm.fail_next_allocation(PalError::OutOfGpuMemory);
    let mut qc = BaseQueueContext::new(mm.clone());

    assert_eq!(
        qc.create_timestamp_mem(true),
        Err(PalError::OutOfGpuMemory)
    );
    assert_eq!(qc.state(), QueueContextState::Uninitialized);
    assert!(!qc.timestamps().exclusive_exec_ts().is_bound());
    assert!(!qc.timestamps().wait_for_idle_ts().is_bound());

    drop(qc);
    assert_eq!(mm.free_count(), 0);
}

#[test]
fn map_failure_keeps_partial_bindings() {
    let mm = Arc::new(NullMemoryManager::new());
    mm.fail_next_map(PalError::NotMappable);
    let mut qc = BaseQueueContext::new(mm.clone());

    assert_eq!(qc.create_timestamp_mem(true), Err(PalError::NotMappable));
    assert_eq!(qc.state(), QueueContextState::Uninitialized);
    assert!(qc.timestamps().exclusive_exec_ts().is_bound());
    assert!(qc.timestamps().wait_for_idle_ts().is_bound());

    drop(qc);
    assert_eq!(mm.free_count(), 1);
    assert_eq!(mm.live_allocations(), 0);
}

#[test]
fn timestamp_queue_brackets_submissions() {
    let mm = Arc::new(NullMemoryManager::new());
    mm.set_paging_fence(77);
    let mut qc = TimestampQueueContext::new(mm.clone(), true);
    assert!(qc.is_idle().unwrap());
    assert_eq!(qc.state(), QueueContextState::Uninitialized);

    let out = qc
        .pre_process_submit(&SubmitInfo {
            cmd_stream_count: 2,
            gpu_mem_refs: &[],
        })
        .unwrap();
    assert_eq!(
        out,
        InternalSubmitInfo {
            num_preamble_cmd_streams: 1,
            num_postamble_cmd_streams: 1,
            paging_fence: 77,
        }
    );
    assert_eq!(qc.state(), QueueContextState::TimestampReady);
    assert_eq!(qc.last_timestamp(), 1);
    assert!(!qc.is_idle().unwrap());

    qc.pre_process_submit(&SubmitInfo::default()).unwrap();
    assert_eq!(qc.last_timestamp(), 2);
    assert_eq!(mm.alloc_count(), 1);

    let exclusive = *qc.timestamps().exclusive_exec_ts();
    let wait_for_idle = *qc.timestamps().wait_for_idle_ts();

    // Stand-in for the postamble of the first submission.
    mm.write_u32(exclusive.memory().unwrap(), exclusive.offset(), 1)
        .unwrap();
    assert!(qc.has_completed(1).unwrap());
    assert!(!qc.has_completed(2).unwrap());
    assert!(!qc.is_idle().unwrap());

    mm.write_u32(wait_for_idle.memory().unwrap(), wait_for_idle.offset(), 2)
        .unwrap();
    assert!(qc.is_idle().unwrap());
    assert_eq!(qc.timestamps().read_wait_for_idle(), Ok(2));

    drop(qc);
    assert_eq!(mm.live_allocations(), 0);
}

#[test]
fn timestamp_queue_without_wait_for_idle_polls_exclusive_exec() {
    let mm = Arc::new(NullMemoryManager::new());
    let mut qc = TimestampQueueContext::new(mm.clone(), false);
    qc.pre_process_submit(&SubmitInfo::default()).unwrap();
    assert!(!qc.timestamps().wait_for_idle_ts().is_bound());
    assert!(!qc.is_idle().unwrap());

    let exclusive = *qc.timestamps().exclusive_exec_ts();
    mm.write_u32(exclusive.memory().unwrap(), exclusive.offset(), 1)
        .unwrap();
    assert!(qc.is_idle().unwrap());
}

#[test]
fn timestamp_queue_failure_is_sticky() {
    let mm = Arc::new(NullMemoryManager::new());
    mm.fail_next_allocation(PalError::OutOfGpuMemory);
    let mut qc = TimestampQueueContext::new(mm.clone(), true);

    assert_eq!(
        qc.pre_process_submit(&SubmitInfo::default()),
        Err(PalError::OutOfGpuMemory)
    );
    assert!(matches!(
        qc.pre_process_submit(&SubmitInfo::default()),
        Err(PalError::Indeterminate(_))
    ));
    assert_eq!(mm.alloc_count(), 0);
    assert_eq!(qc.last_timestamp(), 0);
}

#[test]
fn queue_contexts_from_context_share_its_memory_manager() {
    let ctx = Context::headless(Settings::default());
    let mut qc = ctx.make_timestamp_queue_context(false);
    qc.pre_process_submit(&SubmitInfo::default()).unwrap();

    let memory = qc.timestamps().exclusive_exec_ts().memory().unwrap();
    assert_ne!(ctx.memory_manager().gpu_virt_addr(memory), 0);

    let mut base = ctx.make_queue_context();
    assert_eq!(
        base.pre_process_submit(&SubmitInfo::default()),
        Ok(InternalSubmitInfo::default())
    );
}
