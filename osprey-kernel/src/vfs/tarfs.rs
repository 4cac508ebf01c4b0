//! Read-only TAR filesystem for the initramfs.
//!
//! The archive bytes come straight from the bootloader module and stay
//! resident for the kernel's lifetime; vnodes borrow into them.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use osprey_abi::{SysError, SysResult};
use tar_no_std::TarArchiveRef;

use super::{DirEntry, FileStat, POLL_READABLE, VNode};

/// A directory in the archive tree.
struct TarDir {
    entries: BTreeMap<String, Arc<dyn VNode>>,
}

/// A regular file backed by archive bytes.
struct TarFile {
    data: &'static [u8],
}

pub struct TarFs;

impl TarFs {
    /// Parse `data` into a vnode tree. The slice must stay alive for
    /// the kernel's lifetime (the initramfs module does). An empty or
    /// unparsable archive mounts as an empty root.
    pub fn build(data: &'static [u8]) -> Arc<dyn VNode> {
        let Ok(archive) = TarArchiveRef::new(data) else {
            return Arc::new(TarDir {
                entries: BTreeMap::new(),
            });
        };

        // Collect (path, file) pairs first, then fold into a tree.
        let mut files: Vec<(String, &'static [u8])> = Vec::new();
        for entry in archive.entries() {
            let name = match entry.filename().as_str() {
                Ok(name) => String::from(name.trim_start_matches("./").trim_end_matches('/')),
                Err(_) => continue,
            };
            if name.is_empty() {
                continue;
            }
            files.push((name, entry.data()));
        }

        build_dir("", &files)
    }
}

fn build_dir(prefix: &str, files: &[(String, &'static [u8])]) -> Arc<dyn VNode> {
    let mut entries: BTreeMap<String, Arc<dyn VNode>> = BTreeMap::new();
    let mut subdirs: Vec<String> = Vec::new();

    for (path, data) in files {
        let Some(rest) = strip_prefix(path, prefix) else {
            continue;
        };
        match rest.split_once('/') {
            None => {
                entries.insert(
                    String::from(rest),
                    Arc::new(TarFile { data }) as Arc<dyn VNode>,
                );
            }
            Some((dir, _)) => {
                if !subdirs.iter().any(|d| d == dir) {
                    subdirs.push(String::from(dir));
                }
            }
        }
    }

    for dir in subdirs {
        let child_prefix = if prefix.is_empty() {
            dir.clone()
        } else {
            alloc::format!("{prefix}/{dir}")
        };
        entries.insert(dir, build_dir(&child_prefix, files));
    }

    Arc::new(TarDir { entries })
}

fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    path.strip_prefix(prefix)?.strip_prefix('/')
}

impl VNode for TarDir {
    fn lookup(&self, name: &str) -> SysResult<Arc<dyn VNode>> {
        self.entries.get(name).cloned().ok_or(SysError::NotExists)
    }

    fn stat(&self) -> SysResult<FileStat> {
        Ok(FileStat {
            size: 0,
            is_dir: true,
        })
    }

    fn list_dir(&self) -> SysResult<Vec<DirEntry>> {
        Ok(self
            .entries
            .iter()
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                is_dir: node.stat().map(|s| s.is_dir).unwrap_or(false),
            })
            .collect())
    }

    fn poll(&self) -> u32 {
        POLL_READABLE
    }
}

impl VNode for TarFile {
    fn read(&self, offset: u64, buf: &mut [u8], _flags: u32) -> SysResult<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, _offset: u64, _buf: &[u8], _flags: u32) -> SysResult<usize> {
        // The initramfs is read-only by construction.
        Err(SysError::NoPermissions)
    }

    fn stat(&self) -> SysResult<FileStat> {
        Ok(FileStat {
            size: self.data.len() as u64,
            is_dir: false,
        })
    }

    fn poll(&self) -> u32 {
        POLL_READABLE
    }
}
