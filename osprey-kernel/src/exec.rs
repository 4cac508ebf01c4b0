//! ELF image loading and process creation.
//!
//! Loads `ET_EXEC`/`ET_DYN` images from the VFS into a fresh address
//! space. When the image names a `PT_INTERP` dynamic linker, the linker
//! is loaded too and receives control, with the main image described in
//! the auxiliary vector.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use goblin::elf::Elf;
use goblin::elf::program_header::{PT_INTERP, PT_LOAD};
use log::debug;
use osprey_abi::{SysError, SysResult};
use x86_64::VirtAddr;

use crate::handle::Object;
use crate::memory::page_map::USER_BASE;
use crate::memory::{MapFlags, Mapping, PAGE_SIZE, align_down, align_up};
use crate::sched::process::Process;
use crate::sched::thread::{Thread, ThreadEntry};
use crate::vfs;

/// Load bias for position-independent executables.
const IMAGE_BASE: u64 = USER_BASE + 0x1000_0000;
/// Load bias for the dynamic linker.
const INTERP_BASE: u64 = USER_BASE + 0x20_0000_0000;
/// Initial user stack size.
const STACK_SIZE: usize = 256 * 1024;

// Auxiliary vector tags consumed by the dynamic linker.
const AT_NULL: u64 = 0;
const AT_PHDR: u64 = 3;
const AT_PHENT: u64 = 4;
const AT_PHNUM: u64 = 5;
const AT_PAGESZ: u64 = 6;
const AT_BASE: u64 = 7;
const AT_ENTRY: u64 = 9;

struct LoadedObject {
    entry: u64,
    bias: u64,
    phdr_vaddr: u64,
    phent: u64,
    phnum: u64,
}

/// Read a whole file out of the VFS.
fn read_file(path: &str) -> SysResult<Vec<u8>> {
    let vnode = vfs::resolve(path)?;
    let stat = vnode.stat()?;
    let mut data = alloc::vec![0u8; stat.size as usize];
    let mut read = 0;
    while read < data.len() {
        let n = vnode.read(read as u64, &mut data[read..], 0)?;
        if n == 0 {
            return Err(SysError::InvalidArgument);
        }
        read += n;
    }
    Ok(data)
}

/// Map one ELF object's PT_LOAD segments into `process`.
fn load_object(process: &Process, data: &[u8], bias_hint: u64) -> SysResult<LoadedObject> {
    let elf = Elf::parse(data).map_err(|_| SysError::InvalidArgument)?;
    if !elf.is_64 || elf.header.e_machine != goblin::elf::header::EM_X86_64 {
        return Err(SysError::Unsupported);
    }

    let bias = match elf.header.e_type {
        goblin::elf::header::ET_DYN => bias_hint,
        goblin::elf::header::ET_EXEC => 0,
        _ => return Err(SysError::Unsupported),
    };

    let mut phdr_vaddr = 0;
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let start = bias + ph.p_vaddr;
        let end = start + ph.p_memsz;
        if start < USER_BASE {
            return Err(SysError::InvalidArgument);
        }

        let map_start = align_down(start as usize, PAGE_SIZE);
        let map_size = align_up(end as usize, PAGE_SIZE) - map_start;
        let flags = MapFlags {
            user: true,
            // Populated before the process runs; tightening to the
            // segment's real W bit would require a protect pass after
            // the copy, which `update_permissions` below does.
            writable: true,
            executable: ph.p_flags & goblin::elf::program_header::PF_X != 0,
            uncached: false,
        };
        let mapping = Mapping::new_anonymous(
            &process.page_map,
            VirtAddr::new(map_start as u64),
            map_size,
            flags,
        )
        .ok_or(SysError::NoMem)?;

        let file_bytes = data
            .get(ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize)
            .ok_or(SysError::InvalidArgument)?;
        mapping.write_bytes(start as usize - map_start, file_bytes);

        // Segments that should not stay writable get their final
        // permissions once the copy is in.
        if ph.p_flags & goblin::elf::program_header::PF_W == 0 {
            for page in (map_start..map_start + map_size).step_by(PAGE_SIZE) {
                process.page_map.protect(
                    VirtAddr::new(page as u64),
                    MapFlags {
                        user: true,
                        writable: false,
                        executable: flags.executable,
                        uncached: false,
                    },
                );
            }
        }

        process.add_mapping(mapping);

        // The program header table usually lives inside the first
        // segment; compute its runtime address for the auxv.
        if ph.p_offset <= elf.header.e_phoff
            && elf.header.e_phoff < ph.p_offset + ph.p_filesz
        {
            phdr_vaddr = start + (elf.header.e_phoff - ph.p_offset);
        }
    }

    Ok(LoadedObject {
        entry: bias + elf.header.e_entry,
        bias,
        phdr_vaddr,
        phent: elf.header.e_phentsize as u64,
        phnum: elf.header.e_phnum as u64,
    })
}

/// Find the PT_INTERP path, if any.
fn interpreter_path(data: &[u8]) -> SysResult<Option<String>> {
    let elf = Elf::parse(data).map_err(|_| SysError::InvalidArgument)?;
    for ph in &elf.program_headers {
        if ph.p_type == PT_INTERP {
            let bytes = data
                .get(ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize)
                .ok_or(SysError::InvalidArgument)?;
            let s = core::str::from_utf8(bytes)
                .map_err(|_| SysError::InvalidArgument)?
                .trim_end_matches('\0');
            return Ok(Some(String::from(s)));
        }
    }
    Ok(None)
}

/// Build the SysV startup stack: argc, argv, envp terminator and the
/// auxiliary vector, with argument strings above them.
fn build_stack(
    process: &Process,
    args: &[String],
    image: &LoadedObject,
    interp_bias: u64,
) -> SysResult<VirtAddr> {
    let base = process.alloc_user_range(STACK_SIZE);
    let mapping = Mapping::new_anonymous(
        &process.page_map,
        base,
        STACK_SIZE,
        MapFlags {
            user: true,
            writable: true,
            executable: false,
            uncached: false,
        },
    )
    .ok_or(SysError::NoMem)?;

    // Lay out from the top down: strings first, then the vectors.
    let mut string_addrs = Vec::with_capacity(args.len());
    let mut cursor = STACK_SIZE;
    for arg in args {
        cursor -= arg.len() + 1;
        mapping.write_bytes(cursor, arg.as_bytes());
        mapping.write_bytes(cursor + arg.len(), &[0]);
        string_addrs.push(base.as_u64() + cursor as u64);
    }
    cursor &= !0xf;

    let auxv = [
        (AT_PHDR, image.phdr_vaddr),
        (AT_PHENT, image.phent),
        (AT_PHNUM, image.phnum),
        (AT_PAGESZ, PAGE_SIZE as u64),
        (AT_BASE, interp_bias),
        (AT_ENTRY, image.entry),
        (AT_NULL, 0),
    ];

    // argc + argv[] + NULL + envp NULL + auxv pairs.
    let words = 1 + args.len() + 1 + 1 + auxv.len() * 2;
    cursor -= words * 8;
    cursor &= !0xf;

    let mut vec_bytes = Vec::with_capacity(words * 8);
    vec_bytes.extend_from_slice(&(args.len() as u64).to_le_bytes());
    for addr in &string_addrs {
        vec_bytes.extend_from_slice(&addr.to_le_bytes());
    }
    vec_bytes.extend_from_slice(&0u64.to_le_bytes()); // argv terminator
    vec_bytes.extend_from_slice(&0u64.to_le_bytes()); // empty envp
    for (tag, value) in auxv {
        vec_bytes.extend_from_slice(&tag.to_le_bytes());
        vec_bytes.extend_from_slice(&value.to_le_bytes());
    }
    mapping.write_bytes(cursor, &vec_bytes);

    let sp = base + cursor as u64;
    process.add_mapping(mapping);
    Ok(sp)
}

/// Load `path` into a new process and hand its main thread to the
/// scheduler.
///
/// `std_handles` populate slots 0..3 of the child's handle table;
/// `None` falls back to the kernel console.
pub fn spawn_process(
    path: &str,
    args: &[String],
    std_handles: [Option<Object>; 3],
) -> SysResult<Arc<Process>> {
    let data = read_file(path)?;

    let name = path.rsplit('/').next().unwrap_or(path);
    let process = Process::new(name);

    let image = load_object(&process, &data, IMAGE_BASE)?;

    let (entry, interp_bias) = match interpreter_path(&data)? {
        Some(interp) => {
            debug!("{name}: dynamic, interpreter {interp}");
            let interp_data = read_file(&interp)?;
            let loaded = load_object(&process, &interp_data, INTERP_BASE)?;
            (loaded.entry, loaded.bias)
        }
        None => (image.entry, 0),
    };

    let sp = build_stack(&process, args, &image, interp_bias)?;

    // Standard handles occupy the first three slots.
    let console = crate::vfs::console_vnode();
    for (slot, handle) in std_handles.into_iter().enumerate() {
        let object = handle.unwrap_or_else(|| {
            Object::OpenFile(Arc::new(crate::vfs::OpenFile::new(console.clone(), 0)))
        });
        let index = process.handles.insert(object);
        debug_assert_eq!(index, slot);
    }

    let thread = Thread::new(
        name,
        crate::cpu::pick_cpu(),
        process.clone(),
        ThreadEntry::User {
            ip: VirtAddr::new(entry),
            sp,
            arg: 0,
        },
    );
    crate::sched::spawn(&thread);

    Ok(process)
}
