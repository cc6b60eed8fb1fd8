//! Tests that need a real Vulkan implementation. Each one returns early
//! when no loader or adapter is available.

use std::sync::Arc;

use ash::vk;
use tritex_vk::adapter::{Adapter, AdapterRequirements, select_adapter};
use tritex_vk::buffer::{BindMemoryError, Buffer, BufferDesc};
use tritex_vk::command::CommandPool;
use tritex_vk::device::{Device, DeviceDesc};
use tritex_vk::image::{Image, ImageDesc};
use tritex_vk::instance::Instance;
use tritex_vk::memory::{Memory, MemoryUsage};
use tritex_vk::queue::GraphicsQueue;
use tritex_vk::sync::{Fence, FenceState, WaitFenceError};

struct Gpu {
    device: Arc<Device>,
    queue: GraphicsQueue,
    pool: CommandPool,
}

fn instance() -> Option<Arc<Instance>> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    // SAFETY: loads the system Vulkan loader; tests accept its side effects.
    match unsafe { Instance::new_headless("tritex-vk tests", None) } {
        Ok(instance) => Some(Arc::new(instance)),
        Err(e) => {
            eprintln!("skipping: no Vulkan instance ({e})");
            None
        }
    }
}

fn gpu() -> Option<Gpu> {
    let instance = instance()?;
    let adapters = Adapter::enumerate(&instance).ok()?;
    let Ok(selection) = select_adapter(&adapters, &AdapterRequirements::headless())
    else {
        eprintln!("skipping: no graphics-capable adapter");
        return None;
    };
    let adapter = &adapters[selection.adapter_index];
    let family = selection.queue_family_index;
    let device = Arc::new(
        Device::new(&instance, adapter, &DeviceDesc::single_queue(family, false))
            .expect("device creation"),
    );
    let queue = device
        .queue::<GraphicsQueue>(family, 0)
        .expect("graphics queue");
    let pool = CommandPool::new(&device, family, Some("test pool")).expect("command pool");
    Some(Gpu {
        device,
        queue,
        pool,
    })
}

#[test]
fn enumerated_queue_families_match_direct_query() {
    let Some(instance) = instance() else { return };
    let adapters = Adapter::enumerate(&instance).expect("enumerate adapters");
    for adapter in &adapters {
        assert_eq!(
            adapter.queue_families(),
            adapter.query_queue_families(&instance).as_slice(),
            "stale queue family snapshot for {}",
            adapter.name()
        );
    }
}

#[test]
fn selection_is_deterministic() {
    let Some(instance) = instance() else { return };
    let requirements = AdapterRequirements::headless();
    let first = select_adapter(
        &Adapter::enumerate(&instance).expect("enumerate adapters"),
        &requirements,
    );
    for _ in 0..3 {
        let again = select_adapter(
            &Adapter::enumerate(&instance).expect("enumerate adapters"),
            &requirements,
        );
        assert_eq!(first, again);
    }
}

#[test]
fn staging_round_trip_preserves_bytes() {
    let Some(gpu) = gpu() else { return };
    let data: Vec<u32> = (0..1024u32).map(|i| i.wrapping_mul(2_654_435_761)).collect();

    let device_local = Buffer::upload_via_staging(
        &gpu.device,
        &gpu.pool,
        &gpu.queue,
        &data,
        vk::BufferUsageFlags::TRANSFER_SRC,
        Some("round trip"),
    )
    .expect("upload");
    let read = device_local
        .read_back_via_staging(&gpu.pool, &gpu.queue)
        .expect("read back");

    assert_eq!(read, bytemuck::cast_slice::<u32, u8>(&data));
}

#[test]
fn second_bind_is_rejected() {
    let Some(gpu) = gpu() else { return };
    let desc = BufferDesc {
        size: 256,
        usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
    };
    let mut buffer = Buffer::new(&gpu.device, &desc, Some("bind twice")).expect("buffer");
    let reqs = buffer.memory_requirements().expect("live buffer");

    let first = Memory::allocate(&gpu.device, reqs, MemoryUsage::CpuToGpu, true, None)
        .expect("first allocation");
    buffer.bind_memory(first).expect("first bind");

    let second = Memory::allocate(&gpu.device, reqs, MemoryUsage::CpuToGpu, true, None)
        .expect("second allocation");
    assert!(matches!(
        buffer.bind_memory(second),
        Err(BindMemoryError::AlreadyBound)
    ));
    assert!(buffer.is_bound());
}

#[test]
fn second_image_bind_is_rejected() {
    let Some(gpu) = gpu() else { return };
    let desc = ImageDesc {
        extent: vk::Extent2D {
            width: 16,
            height: 16,
        },
        ..Default::default()
    };
    let mut image =
        Image::allocated(&gpu.device, &desc, Some("bind twice")).expect("image");
    let bound_type = image.memory().map(Memory::memory_type_index);
    let reqs = image.memory_requirements().expect("live image");

    let second = Memory::allocate(&gpu.device, reqs, MemoryUsage::GpuOnly, false, None)
        .expect("second allocation");
    assert!(matches!(
        image.bind_memory(second),
        Err(BindMemoryError::AlreadyBound)
    ));
    assert_eq!(image.memory().map(Memory::memory_type_index), bound_type);
}

#[test]
fn borrowed_views_do_not_free() {
    let Some(gpu) = gpu() else { return };
    let desc = BufferDesc {
        size: 64,
        usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
    };
    let mut owner = Buffer::allocated(&gpu.device, &desc, MemoryUsage::CpuToGpu, None)
        .expect("buffer");
    {
        let mut view = owner.borrowed();
        view.release();
        view.release();
    }
    owner.write_pod(0, &[7u32; 16]).expect("owner still usable");
    owner.release();
    owner.release();
    assert!(owner.ownership().is_none());
}

#[test]
fn fence_follows_wait_reset_cycle() {
    let Some(gpu) = gpu() else { return };
    let mut fence = Fence::new(&gpu.device, true, Some("cycle")).expect("fence");
    assert_eq!(fence.state(), FenceState::Signaled);

    fence.wait_and_reset(u64::MAX).expect("first wait");
    assert_eq!(fence.state(), FenceState::Unsignaled);
    assert!(matches!(
        fence.wait(0),
        Err(WaitFenceError::NotSubmitted)
    ));

    let mut cmd = gpu.pool.allocate(None).expect("command buffer");
    cmd.begin(true).expect("begin");
    cmd.end().expect("end");
    // SAFETY: the command buffer is empty and the fence is waited on
    // before either is dropped.
    unsafe {
        use tritex_vk::queue::{SubmitBatch, Submittable};
        gpu.queue.submit(
            &[SubmitBatch {
                wait: &[],
                command_buffers: &[&cmd],
                signal: &[],
            }],
            Some(&mut fence),
        )
    }
    .expect("submit");
    assert_eq!(fence.state(), FenceState::Pending);

    fence.wait(u64::MAX).expect("wait after submit");
    assert_eq!(fence.state(), FenceState::Signaled);
    fence.reset().expect("reset after wait");
    assert_eq!(fence.state(), FenceState::Unsignaled);
}
