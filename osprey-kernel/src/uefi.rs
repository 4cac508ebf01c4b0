//! UEFI boot hand-off.
//!
//! Everything the kernel needs from firmware is collected into a
//! `BootInfo` before `exit_boot_services`: the memory map, the ACPI2
//! RSDP, the GOP framebuffer geometry and the `initramfs.tar` module
//! loaded from the boot volume. The info is frozen from then on.

use core::ptr::slice_from_raw_parts_mut;

use ::uefi::{
    CStr16,
    boot::{self, AllocateType, MemoryType},
    mem::memory_map::MemoryMapOwned,
    proto::console::gop::GraphicsOutput,
    proto::media::file::{File, FileAttribute, FileInfo, FileMode},
};
use x86_64::PhysAddr;

use crate::devices::framebuffer::BootFramebuffer;

pub struct BootInfo {
    pub acpi2_rsdp: Option<PhysAddr>,
    pub memory_map: MemoryMapOwned,
    pub framebuffer: Option<BootFramebuffer>,
    pub initramfs: &'static [u8],
}

pub fn init() {
    ::uefi::helpers::init().unwrap();
}

/// Collect the boot information and leave boot services.
pub fn collect_and_exit_boot_services() -> BootInfo {
    let system_table = ::uefi::table::system_table_raw().expect("No UEFI system table");
    let system_table = unsafe { system_table.as_ref() };

    let mut acpi2_rsdp = None;
    for i in 0..system_table.number_of_configuration_table_entries as isize {
        let config_table = unsafe { system_table.configuration_table.offset(i) };
        let config_table_ref = unsafe {
            config_table
                .as_ref()
                .expect("Could not get UEFI config table at index {i}")
        };

        if config_table_ref.vendor_guid == ::uefi::table::cfg::ConfigTableEntry::ACPI2_GUID {
            acpi2_rsdp = Some(PhysAddr::new(config_table_ref.vendor_table as u64));
        }
    }

    let framebuffer = query_framebuffer();
    // The test harness boots without a module; the empty slice mounts
    // as an empty root.
    let initramfs = load_file("\\initramfs.tar")
        .map(|data| unsafe { &*data })
        .unwrap_or(&[]);

    let memory_map = unsafe { ::uefi::boot::exit_boot_services(None) };

    BootInfo {
        acpi2_rsdp,
        memory_map,
        framebuffer,
        initramfs,
    }
}

/// The GOP linear framebuffer, if the firmware set one up.
fn query_framebuffer() -> Option<BootFramebuffer> {
    let handle = boot::get_handle_for_protocol::<GraphicsOutput>().ok()?;
    let mut gop = boot::open_protocol_exclusive::<GraphicsOutput>(handle).ok()?;

    let mode = gop.current_mode_info();
    let (width, height) = mode.resolution();
    let mut fb = gop.frame_buffer();

    Some(BootFramebuffer {
        phys_base: fb.as_mut_ptr() as u64,
        pitch: mode.stride() * 4,
        width: width as u32,
        height: height as u32,
        bpp: 32,
    })
}

/// Load a file from the boot volume into loader-data pages that outlive
/// boot services. `None` when the file does not exist.
fn load_file(path: &str) -> Option<*const [u8]> {
    let mut buf = [0u16; 255];
    let path =
        CStr16::from_str_with_buf(path, &mut buf).expect("could not convert path to CStr16");

    let mut fs =
        boot::get_image_file_system(boot::image_handle()).expect("could not load file system");

    let mut root = fs.open_volume().expect("failed to open volume");
    let handle = root.open(path, FileMode::Read, FileAttribute::empty()).ok()?;

    let mut buf = [0u8; 256];
    let mut file = handle
        .into_regular_file()
        .expect("file should be a regular file");
    let file_info = file
        .get_info::<FileInfo>(&mut buf)
        .expect("could not get file info");

    let file_size = file_info.file_size();
    let page_count = file_size.div_ceil(4096);

    let data = ::uefi::boot::allocate_pages(
        AllocateType::AnyPages,
        MemoryType::LOADER_DATA,
        page_count as usize,
    )
    .expect("could not allocate memory for file data");

    let data = slice_from_raw_parts_mut(data.as_ptr(), file_size as usize);

    file.read(unsafe { data.as_mut_unchecked() })
        .expect("could not read file contents");

    Some(data)
}
