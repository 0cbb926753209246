//! Smoke tests against a real HIP device. Skipped when none is available.

mod common;

use common::{serial, GPU_FIXTURE, MIB};
use rocm_device::backend::{enumerate_devices, hipew};
use rocm_device::{DeviceMemory, HipContextScope, MemoryType};

#[test]
#[serial]
fn test_device_enumeration_matches_open_device() {
    let Some(fixture) = GPU_FIXTURE.as_ref() else {
        return;
    };
    let driver = hipew::driver().expect("driver initialized by fixture");
    let devices = enumerate_devices(driver.as_ref());
    assert!(!devices.is_empty());
    assert_eq!(devices[0].gcn_arch, fixture.device().capabilities().gcn_arch);
}

#[test]
#[serial]
fn test_memory_round_trip_on_gpu() {
    let Some(fixture) = GPU_FIXTURE.as_ref() else {
        return;
    };
    let device = fixture.device();

    let mut mem = DeviceMemory::new("smoke", MemoryType::ReadWrite, MIB);
    let data: Vec<u8> = (0..MIB).map(|i| (i % 251) as u8).collect();
    device.mem_copy_to(&mut mem, &data).unwrap();

    let mut out = vec![0u8; MIB];
    device.mem_copy_from(&mem, 0, &mut out).unwrap();
    assert_eq!(out, data);

    device.mem_zero(&mut mem).unwrap();
    device.mem_copy_from(&mem, 0, &mut out[..4096]).unwrap();
    assert!(out[..4096].iter().all(|&b| b == 0));

    device.mem_free(&mut mem).unwrap();
    assert!(!device.have_error());
    fixture.assert_no_leak(5);
}

#[test]
#[serial]
fn test_queue_and_scope_on_gpu() {
    let Some(fixture) = GPU_FIXTURE.as_ref() else {
        return;
    };
    let device = fixture.device();
    {
        let scope = HipContextScope::new(device);
        scope.check().unwrap();
    }

    let queue = device.create_queue().unwrap();
    let mut mem = DeviceMemory::new("queue", MemoryType::ReadWrite, 4096);
    queue.copy_to_device(&mut mem, &[3u8; 4096]).unwrap();
    let mut out = [0u8; 4096];
    queue.copy_from_device(&mem, &mut out).unwrap();
    assert_eq!(out, [3u8; 4096]);
    queue.synchronize().unwrap();

    device.mem_free(&mut mem).unwrap();
}
