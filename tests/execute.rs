//! Freshly written code runs on another thread after the instruction cache is synced.

#![cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]

use std::thread;

use nearmap::{MapperConfig, MemoryMapper, MemoryRegion};

/// `mov eax, value; ret`
#[cfg(target_arch = "x86_64")]
fn return_constant(value: u16) -> Vec<u8> {
    let mut code = vec![0xB8];
    code.extend_from_slice(&u32::from(value).to_le_bytes());
    code.push(0xC3);
    code
}

/// `movz w0, #value; ret`
#[cfg(target_arch = "aarch64")]
fn return_constant(value: u16) -> Vec<u8> {
    let movz = 0x5280_0000u32 | (u32::from(value) << 5);
    let ret = 0xD65F_03C0u32;
    let mut code = movz.to_le_bytes().to_vec();
    code.extend_from_slice(&ret.to_le_bytes());
    code
}

fn call_on_new_thread(region: &MemoryRegion) -> u32 {
    let entry = region.start();
    thread::spawn(move || {
        let function: extern "C" fn() -> u32 = unsafe { std::mem::transmute(entry) };
        function()
    })
    .join()
    .unwrap()
}

#[test]
fn encoding_of_forty_two() {
    #[cfg(target_arch = "x86_64")]
    assert_eq!(return_constant(42), [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);
    #[cfg(target_arch = "aarch64")]
    assert_eq!(
        return_constant(42),
        [0x40, 0x05, 0x80, 0x52, 0xC0, 0x03, 0x5F, 0xD6]
    );
}

#[test]
fn written_code_runs_cross_thread() {
    let mapper = MemoryMapper::new().unwrap();
    let mut region = mapper.acquire_code_region(64).unwrap();

    region.write(0, &return_constant(42)).unwrap();
    mapper.publish(&mut region).unwrap();
    assert_eq!(call_on_new_thread(&region), 42);

    mapper.release_region(region).unwrap();
}

#[test]
fn rewritten_code_is_not_stale() {
    for config in [MapperConfig::default(), MapperConfig::hardened()] {
        let mapper = MemoryMapper::with_config(config).unwrap();
        let mut region = mapper.acquire_code_region(64).unwrap();

        for value in [1u16, 2, 3, 500, 4095] {
            mapper.make_writable(&mut region).unwrap();
            region.write(0, &return_constant(value)).unwrap();
            mapper.publish(&mut region).unwrap();
            assert_eq!(call_on_new_thread(&region), u32::from(value));
        }

        mapper.release_region(region).unwrap();
    }
}
