#![no_std]
#![no_main]

extern crate alloc;

use alloc::vec::Vec;

use osprey_abi::SysError;
use osprey_kernel::vfs::{self, OpenFile, TarFs};

osprey_kernel::test_harness!(
    resolve_finds_files_and_directories,
    read_returns_file_contents,
    list_dir_enumerates_entries,
    missing_paths_are_not_exists,
    initramfs_files_are_read_only,
);

/// Build a minimal ustar archive in leaked memory.
fn build_tar(files: &[(&str, &[u8])]) -> &'static [u8] {
    let mut out = Vec::new();
    for (name, data) in files {
        let mut header = [0u8; 512];
        header[..name.len()].copy_from_slice(name.as_bytes());
        header[100..107].copy_from_slice(b"0000644");
        header[108..115].copy_from_slice(b"0000000");
        header[116..123].copy_from_slice(b"0000000");
        let mut size = *b"00000000000";
        let mut value = data.len();
        for slot in size.iter_mut().rev() {
            *slot = b'0' + (value % 8) as u8;
            value /= 8;
        }
        header[124..135].copy_from_slice(&size);
        header[136..147].copy_from_slice(b"00000000000");
        header[156] = b'0';
        header[257..262].copy_from_slice(b"ustar");
        header[263..265].copy_from_slice(b"00");

        // Checksum is computed with the checksum field spaced out.
        header[148..156].copy_from_slice(b"        ");
        let sum: u32 = header.iter().map(|&b| b as u32).sum();
        let mut checksum = *b"000000\0 ";
        let mut value = sum;
        for slot in checksum[..6].iter_mut().rev() {
            *slot = b'0' + (value % 8) as u8;
            value /= 8;
        }
        header[148..156].copy_from_slice(&checksum);

        out.extend_from_slice(&header);
        out.extend_from_slice(data);
        out.resize(out.len().next_multiple_of(512), 0);
    }
    // Two zero blocks terminate the archive.
    out.resize(out.len() + 1024, 0);
    alloc::boxed::Box::leak(out.into_boxed_slice())
}

fn mount_fixture() {
    static MOUNTED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);
    if MOUNTED.swap(true, core::sync::atomic::Ordering::SeqCst) {
        return;
    }
    let tar = build_tar(&[
        ("bin/init", b"\x7fELF fake"),
        ("etc/motd", b"welcome to osprey\n"),
        ("etc/empty", b""),
    ]);
    vfs::mount("/fixture", TarFs::build(tar));
}

fn resolve_finds_files_and_directories() {
    mount_fixture();
    let file = vfs::resolve("/fixture/etc/motd").unwrap();
    assert!(!file.stat().unwrap().is_dir);

    let dir = vfs::resolve("/fixture/etc").unwrap();
    assert!(dir.stat().unwrap().is_dir);
}

fn read_returns_file_contents() {
    mount_fixture();
    let file = OpenFile::new(vfs::resolve("/fixture/etc/motd").unwrap(), 0);
    let mut buf = [0u8; 64];
    let n = file.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"welcome to osprey\n");
    // The cursor advanced to EOF.
    assert_eq!(file.read(&mut buf).unwrap(), 0);
}

fn list_dir_enumerates_entries() {
    mount_fixture();
    let dir = vfs::resolve("/fixture/etc").unwrap();
    let entries = dir.list_dir().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.name == "motd" && !e.is_dir));
    assert!(entries.iter().any(|e| e.name == "empty"));

    let root = vfs::resolve("/fixture").unwrap();
    let entries = root.list_dir().unwrap();
    assert!(entries.iter().any(|e| e.name == "bin" && e.is_dir));
}

fn missing_paths_are_not_exists() {
    mount_fixture();
    assert!(matches!(
        vfs::resolve("/fixture/etc/shadow"),
        Err(SysError::NotExists)
    ));
    assert!(matches!(
        vfs::resolve("/fixture/no/such/dir"),
        Err(SysError::NotExists)
    ));
}

fn initramfs_files_are_read_only() {
    mount_fixture();
    let file = OpenFile::new(vfs::resolve("/fixture/etc/motd").unwrap(), 0);
    assert_eq!(file.write(b"scribble"), Err(SysError::NoPermissions));
}
