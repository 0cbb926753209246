//! Device memory placement and the sticky device error

mod common;

use common::{MockFixture, MIB};
use rocm_device::backend::{ffi, Placement};
use rocm_device::{DeviceConfig, DeviceMemory, HipError, MemoryType};

#[test]
fn test_out_of_memory_is_sticky_until_cleared() {
    let fixture = MockFixture::new(DeviceConfig::default().with_map_host_memory(false));
    let device = &fixture.device;
    // Default working headroom is 32 MiB
    fixture.driver.set_memory(1024 * MIB, 40 * MIB);

    let mut big = DeviceMemory::new("big", MemoryType::ReadWrite, 16 * MIB);
    match device.mem_alloc(&mut big) {
        Err(HipError::OutOfMemory(message)) => {
            assert_eq!(message, "System is out of GPU and shared host memory")
        }
        other => panic!("expected out of memory, got {:?}", other),
    }
    assert!(device.have_error());
    assert!(!big.is_allocated());

    let mut small = DeviceMemory::new("small", MemoryType::ReadWrite, 1024);
    assert!(matches!(device.mem_alloc(&mut small), Err(HipError::PendingError(_))));
    assert!(matches!(device.mem_alloc(&mut small), Err(HipError::PendingError(_))));
    assert!(!small.is_allocated());
    assert_eq!(fixture.driver.live_allocations(), 0);

    device.clear_error();
    device.mem_alloc(&mut small).unwrap();
    assert_eq!(small.placement(), Some(Placement::Device));
    device.mem_free(&mut small).unwrap();
}

#[test]
fn test_first_error_message_wins() {
    let fixture = MockFixture::new(DeviceConfig::default().with_map_host_memory(false));
    fixture.driver.set_memory(64 * MIB, 0);

    let mut mem = DeviceMemory::new("a", MemoryType::ReadOnly, 4096);
    assert!(fixture.device.mem_alloc(&mut mem).is_err());
    assert!(!fixture.device.set_error("later failure"));
    assert_eq!(
        fixture.device.error_message().as_deref(),
        Some("System is out of GPU and shared host memory")
    );
}

#[test]
fn test_falls_back_to_mapped_host_memory() {
    let fixture = MockFixture::new(DeviceConfig::default().with_map_host_limit(8 * MIB));
    fixture.driver.set_memory(1024 * MIB, 33 * MIB);

    let mut mem = DeviceMemory::new("film", MemoryType::ReadWrite, 2 * MIB);
    fixture.device.mem_alloc(&mut mem).unwrap();
    assert!(mem.is_host_mapped());
    assert_eq!(fixture.driver.live_host_allocations(), 1);

    fixture.device.mem_copy_to(&mut mem, &[7u8; 64]).unwrap();
    let mut out = [0u8; 64];
    fixture.device.mem_copy_from(&mem, 0, &mut out).unwrap();
    assert_eq!(out, [7u8; 64]);

    // Beyond the mapped limit nothing is left
    let mut huge = DeviceMemory::new("huge", MemoryType::ReadWrite, 7 * MIB);
    assert!(matches!(fixture.device.mem_alloc(&mut huge), Err(HipError::OutOfMemory(_))));

    fixture.device.mem_free(&mut mem).unwrap();
    assert_eq!(fixture.driver.live_host_allocations(), 0);
}

#[test]
fn test_driver_malloc_failure_falls_through_to_host() {
    let fixture = MockFixture::new(DeviceConfig::default().with_map_host_limit(8 * MIB));
    fixture.driver.fail_next("hipMalloc", ffi::hipErrorOutOfMemory);

    let mut mem = DeviceMemory::new("buffer", MemoryType::ReadWrite, MIB);
    fixture.device.mem_alloc(&mut mem).unwrap();
    assert!(mem.is_host_mapped());
    assert!(!fixture.device.have_error());
    fixture.device.mem_free(&mut mem).unwrap();
}

#[test]
fn test_textures_keep_larger_headroom() {
    let fixture = MockFixture::new(DeviceConfig::default().with_map_host_memory(false));
    // Enough for working memory (32 MiB headroom), not for textures (128 MiB)
    fixture.driver.set_memory(1024 * MIB, 100 * MIB);

    let mut buffer = DeviceMemory::new("buffer", MemoryType::ReadWrite, MIB);
    fixture.device.mem_alloc(&mut buffer).unwrap();

    let mut texture = DeviceMemory::new("texture", MemoryType::Texture, MIB);
    assert!(fixture.device.mem_alloc(&mut texture).is_err());
    fixture.device.clear_error();
    fixture.device.mem_free(&mut buffer).unwrap();
}

#[test]
fn test_dropping_device_frees_leaked_buffers() {
    let fixture = MockFixture::new(DeviceConfig::default());
    let driver = fixture.driver.clone();

    let mut mem = DeviceMemory::new("leaked", MemoryType::ReadWrite, 4096);
    fixture.device.mem_alloc(&mut mem).unwrap();
    assert_eq!(driver.live_allocations(), 1);

    drop(fixture);
    assert_eq!(driver.live_allocations(), 0);
    assert_eq!(driver.live_contexts(), 0);
}

#[test]
fn test_memory_stats_track_placements() {
    let fixture = MockFixture::new(DeviceConfig::default().with_map_host_limit(8 * MIB));
    let mut a = DeviceMemory::new("a", MemoryType::ReadWrite, MIB);
    fixture.device.mem_alloc(&mut a).unwrap();

    let stats = fixture.device.memory_stats().unwrap();
    assert_eq!(stats.used, MIB);
    assert_eq!(stats.map_host_used, 0);
    assert_eq!(stats.allocations, 1);

    fixture.device.mem_free(&mut a).unwrap();
    let stats = fixture.device.memory_stats().unwrap();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.peak, MIB);
    assert_eq!(stats.allocations, 0);
}

#[test]
fn test_working_memory_moves_largest_image_only_as_needed() {
    let fixture = MockFixture::new(
        DeviceConfig::default()
            .with_headroom(MIB, 4 * MIB)
            .with_map_host_limit(64 * MIB),
    );
    let device = &fixture.device;
    fixture.driver.set_memory(64 * MIB, 24 * MIB);

    let mut small = DeviceMemory::new("small_image", MemoryType::Texture, 4 * MIB).with_height(16);
    let mut large = DeviceMemory::new("large_image", MemoryType::Texture, 8 * MIB).with_height(16);
    device.mem_alloc(&mut small).unwrap();
    device.mem_alloc(&mut large).unwrap();
    assert_eq!(fixture.driver.free_memory(), 12 * MIB);

    // 12 MiB plus 1 MiB headroom needs one image moved out
    let mut state = DeviceMemory::new("integrator_state", MemoryType::ReadWrite, 12 * MIB);
    device.mem_alloc(&mut state).unwrap();

    assert_eq!(state.placement(), Some(Placement::Device));
    assert!(large.is_host_mapped());
    assert_eq!(small.placement(), Some(Placement::Device));
    assert_eq!(device.memory_stats().unwrap().map_host_used, 8 * MIB);

    for mem in [&mut small, &mut large, &mut state] {
        device.mem_free(mem).unwrap();
    }
    assert_eq!(fixture.driver.live_allocations(), 0);
    assert_eq!(fixture.driver.live_host_allocations(), 0);
}
