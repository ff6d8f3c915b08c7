//! [`MemoryManager`] on top of a Vulkan device and a `vk_mem` allocator.
//!
//! Every request becomes a dedicated `VkBuffer` with device-address usage,
//! so allocation offsets are always zero. Uploads into memory the CPU cannot
//! map go through a staging buffer and a copy on the transfer queue.

use std::ptr::NonNull;
use std::sync::Mutex;

use ash::vk;
use vk_mem::Alloc;

use crate::utils::{Handle, Pool};
use crate::{
    GpuAllocation, GpuHeap, GpuMemPriority, GpuMemory, GpuMemoryCreateInfo,
    GpuMemoryInternalCreateInfo, GpuMemoryInternalFlags, MemoryManager, PalError, Result,
};

struct VulkanAllocation {
    buffer: vk::Buffer,
    alloc: vk_mem::Allocation,
    address: u64,
    size: u64,
    host_visible: bool,
    /// Mapping held for the allocation's whole life, for always-resident
    /// host-visible memory the CPU polls.
    persistent: Option<NonNull<u8>>,
}

struct TransferQueue {
    queue: vk::Queue,
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

pub struct VulkanMemoryManager {
    device: ash::Device,
    allocator: vk_mem::Allocator,
    allocations: Mutex<Pool<VulkanAllocation>>,
    transfer: Mutex<TransferQueue>,
}

// SAFETY: the allocator is internally synchronized, every allocation is only
// touched while the pool lock is held and the transfer queue only while its
// own lock is held.
unsafe impl Send for VulkanMemoryManager {}
unsafe impl Sync for VulkanMemoryManager {}

impl VulkanMemoryManager {
    /// The device must have `bufferDeviceAddress` enabled.
    ///
    /// Queue 0 of `transfer_family` carries staging copies. Nothing else may
    /// submit to that queue while the manager is alive.
    pub fn new(
        instance: &ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        transfer_family: u32,
    ) -> Result<Self> {
        let allocator = vk_mem::Allocator::new(
            vk_mem::AllocatorCreateInfo::new(instance, &device, physical_device)
                .flags(vk_mem::AllocatorCreateFlags::BUFFER_DEVICE_ADDRESS),
        )?;
        let transfer = TransferQueue::new(&device, transfer_family)?;

        Ok(Self {
            device,
            allocator,
            allocations: Mutex::new(Pool::default()),
            transfer: Mutex::new(transfer),
        })
    }

    fn release(&self, alloc: &mut VulkanAllocation) {
        unsafe {
            if alloc.persistent.take().is_some() {
                self.allocator.unmap_memory(&mut alloc.alloc);
            }
            self.allocator.destroy_buffer(alloc.buffer, &mut alloc.alloc);
        }
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, Pool<VulkanAllocation>> {
        self.allocations
            .lock()
            .expect("vulkan memory manager pool lock poisoned")
    }
}

impl TransferQueue {
    fn new(device: &ash::Device, family: u32) -> Result<Self> {
        let queue = unsafe { device.get_device_queue(family, 0) };
        let pool = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::builder()
                    .queue_family_index(family)
                    .flags(
                        vk::CommandPoolCreateFlags::TRANSIENT
                            | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                    )
                    .build(),
                None,
            )
        }?;

        let cmd = match unsafe {
            device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::builder()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1)
                    .build(),
            )
        } {
            Ok(cmds) => cmds[0],
            Err(err) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(err.into());
            }
        };

        let fence = match unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(fence) => fence,
            Err(err) => {
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(err.into());
            }
        };

        Ok(Self {
            queue,
            pool,
            cmd,
            fence,
        })
    }

    /// Records, submits and waits for a single buffer copy.
    fn copy(
        &self,
        device: &ash::Device,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) -> Result<()> {
        unsafe {
            device.reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(
                self.cmd,
                &vk::CommandBufferBeginInfo::builder()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                    .build(),
            )?;
            device.cmd_copy_buffer(self.cmd, src, dst, &[region]);
            device.end_command_buffer(self.cmd)?;

            device.reset_fences(&[self.fence])?;
            device.queue_submit(
                self.queue,
                &[vk::SubmitInfo::builder()
                    .command_buffers(&[self.cmd])
                    .build()],
                self.fence,
            )?;
            device.wait_for_fences(&[self.fence], true, u64::MAX)?;
        }
        Ok(())
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.fence, None);
            device.destroy_command_pool(self.pool, None);
        }
    }
}

fn cast(memory: GpuMemory) -> Handle<VulkanAllocation> {
    Handle::new(memory.slot, memory.generation)
}

fn uncast(handle: Handle<VulkanAllocation>) -> GpuMemory {
    Handle::<GpuAllocation>::new(handle.slot, handle.generation)
}

fn usage_for(heap: GpuHeap) -> (vk_mem::MemoryUsage, vk_mem::AllocationCreateFlags) {
    match heap {
        GpuHeap::Local => (
            vk_mem::MemoryUsage::AutoPreferDevice,
            vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
        ),
        GpuHeap::Invisible => (
            vk_mem::MemoryUsage::AutoPreferDevice,
            vk_mem::AllocationCreateFlags::empty(),
        ),
        GpuHeap::GartUswc => (
            vk_mem::MemoryUsage::AutoPreferHost,
            vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
        ),
        GpuHeap::GartCacheable => (
            vk_mem::MemoryUsage::AutoPreferHost,
            vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
        ),
    }
}

/// Whether allocations from `heap` are guaranteed to be CPU mappable.
fn host_visible(heap: GpuHeap) -> bool {
    let (_, flags) = usage_for(heap);
    flags.intersects(
        vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE
            | vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM,
    )
}

/// Destination range of an upload, or `None` when it leaves the allocation.
fn copy_region(alloc_size: u64, offset: u64, len: usize) -> Option<vk::BufferCopy> {
    let size = len as u64;
    let end = offset.checked_add(size)?;
    (end <= alloc_size).then_some(vk::BufferCopy {
        src_offset: 0,
        dst_offset: offset,
        size,
    })
}

fn priority_for(priority: GpuMemPriority) -> f32 {
    match priority {
        GpuMemPriority::Unused => 0.0,
        GpuMemPriority::VeryLow => 0.1,
        GpuMemPriority::Low => 0.25,
        GpuMemPriority::Normal => 0.5,
        GpuMemPriority::High => 0.75,
        GpuMemPriority::VeryHigh => 1.0,
    }
}

impl MemoryManager for VulkanMemoryManager {
    fn allocate_gpu_mem(
        &self,
        create_info: &GpuMemoryCreateInfo,
        internal_info: &GpuMemoryInternalCreateInfo,
    ) -> Result<(GpuMemory, u64)> {
        if create_info.size == 0 || create_info.heaps().is_empty() {
            return Err(PalError::InvalidValue);
        }

        let usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        // Later heaps are fallbacks for when the preferred one is exhausted.
        let mut last_err = PalError::OutOfGpuMemory;
        for heap in create_info.heaps() {
            let (mem_usage, flags) = usage_for(*heap);
            let alloc_info = vk_mem::AllocationCreateInfo {
                usage: mem_usage,
                flags,
                priority: priority_for(create_info.priority),
                ..Default::default()
            };

            let created = unsafe {
                self.allocator.create_buffer_with_alignment(
                    &vk::BufferCreateInfo::builder()
                        .size(create_info.size)
                        .usage(usage)
                        .build(),
                    &alloc_info,
                    create_info.alignment,
                )
            };
            let (buffer, mut alloc) = match created {
                Ok(it) => it,
                Err(err) => {
                    last_err = err.into();
                    continue;
                }
            };

            let mut persistent = None;
            if host_visible(*heap)
                && internal_info
                    .flags
                    .contains(GpuMemoryInternalFlags::ALWAYS_RESIDENT)
            {
                match unsafe { self.allocator.map_memory(&mut alloc) } {
                    Ok(ptr) => persistent = NonNull::new(ptr),
                    Err(err) => {
                        unsafe { self.allocator.destroy_buffer(buffer, &mut alloc) };
                        return Err(err.into());
                    }
                }
            }

            let address = unsafe {
                self.device.get_buffer_device_address(
                    &vk::BufferDeviceAddressInfo::builder().buffer(buffer).build(),
                )
            };

            let handle = match self.pool().insert(VulkanAllocation {
                buffer,
                alloc,
                address,
                size: create_info.size,
                host_visible: host_visible(*heap),
                persistent,
            }) {
                Ok(handle) => handle,
                Err(mut rejected) => {
                    self.release(&mut rejected);
                    return Err(PalError::OutOfSlots);
                }
            };

            log::trace!(
                "vulkan_mm: allocated {} bytes at 0x{:X} ({:?}, {:?})",
                create_info.size,
                address,
                heap,
                internal_info.flags
            );
            return Ok((uncast(handle), 0));
        }

        Err(last_err)
    }

    fn free_gpu_mem(&self, memory: GpuMemory, offset: u64) {
        debug_assert_eq!(offset, 0);
        let taken = self.pool().take(cast(memory));
        match taken {
            Some(mut alloc) => self.release(&mut alloc),
            None => {
                log::error!("vulkan_mm: double free of {:?}", memory);
                debug_assert!(false, "double free of GPU memory");
            }
        }
    }

    fn map(&self, memory: GpuMemory) -> Result<NonNull<u8>> {
        let mut pool = self.pool();
        let alloc = pool
            .get_mut_ref(cast(memory))
            .ok_or(PalError::StaleHandle)?;
        let mapped = unsafe { self.allocator.map_memory(&mut alloc.alloc) }?;
        NonNull::new(mapped).ok_or(PalError::NotMappable)
    }

    fn unmap(&self, memory: GpuMemory) -> Result<()> {
        let mut pool = self.pool();
        let alloc = pool
            .get_mut_ref(cast(memory))
            .ok_or(PalError::StaleHandle)?;
        unsafe { self.allocator.unmap_memory(&mut alloc.alloc) };
        Ok(())
    }

    fn upload(&self, memory: GpuMemory, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let (dst, region, host_visible) = {
            let pool = self.pool();
            let alloc = pool.get_ref(cast(memory)).ok_or(PalError::StaleHandle)?;
            let region =
                copy_region(alloc.size, offset, data.len()).ok_or(PalError::InvalidValue)?;
            (alloc.buffer, region, alloc.host_visible)
        };

        if host_visible {
            let base = self.map(memory)?;
            // SAFETY: `copy_region` checked the range against the allocation.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    base.as_ptr().add(offset as usize),
                    data.len(),
                );
            }
            return self.unmap(memory);
        }

        let (staging, mut staging_alloc) = unsafe {
            self.allocator.create_buffer(
                &vk::BufferCreateInfo::builder()
                    .size(region.size)
                    .usage(vk::BufferUsageFlags::TRANSFER_SRC)
                    .build(),
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferHost,
                    flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                    ..Default::default()
                },
            )
        }?;

        let result = (|| -> Result<()> {
            let mapped = unsafe { self.allocator.map_memory(&mut staging_alloc) }?;
            // SAFETY: the staging buffer was created with exactly `data.len()`
            // bytes and is host visible.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), mapped, data.len());
                self.allocator.unmap_memory(&mut staging_alloc);
            }
            self.transfer
                .lock()
                .expect("vulkan memory manager transfer lock poisoned")
                .copy(&self.device, staging, dst, region)
        })();

        unsafe { self.allocator.destroy_buffer(staging, &mut staging_alloc) };
        log::trace!(
            "vulkan_mm: staged {} bytes into {:?}+0x{:X}",
            data.len(),
            memory,
            offset
        );
        result
    }

    fn cpu_addr(&self, memory: GpuMemory) -> Option<NonNull<u8>> {
        self.pool().get_ref(cast(memory))?.persistent
    }

    fn gpu_virt_addr(&self, memory: GpuMemory) -> u64 {
        self.pool()
            .get_ref(cast(memory))
            .map(|alloc| alloc.address)
            .unwrap_or(0)
    }
}

impl Drop for VulkanMemoryManager {
    fn drop(&mut self) {
        let leftovers = self.pool().drain();
        if !leftovers.is_empty() {
            log::warn!("vulkan_mm: {} allocations leaked", leftovers.len());
        }
        for mut alloc in leftovers {
            self.release(&mut alloc);
        }
        self.transfer
            .lock()
            .expect("vulkan memory manager transfer lock poisoned")
            .destroy(&self.device);
    }
}
