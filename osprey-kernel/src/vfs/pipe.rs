//! Anonymous pipes.
//!
//! A pipe is a bounded byte ring shared by a read vnode and a write
//! vnode, with one event per direction for wakeups. Dropping an end
//! marks it closed: readers then drain to EOF, writers observe
//! `ConnectionClosed`.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use osprey_abi::io::OPEN_NON_BLOCK;
use osprey_abi::{SysError, SysResult};
use ring_buffer::ByteRing;
use spinning_top::Spinlock;

use super::{FileStat, POLL_CLOSED, POLL_READABLE, POLL_WRITABLE, VNode};
use crate::sched::event::Event;

struct PipeShared {
    ring: Spinlock<ByteRing>,
    /// Signalled when bytes arrive or the writer closes.
    data_event: Event,
    /// Signalled when space frees up or the reader closes.
    space_event: Event,
    reader_closed: AtomicBool,
    writer_closed: AtomicBool,
}

pub struct PipeReadEnd {
    shared: Arc<PipeShared>,
}

pub struct PipeWriteEnd {
    shared: Arc<PipeShared>,
}

/// Create a connected pipe pair with a ring of `capacity` bytes.
pub fn create_pipe(capacity: usize) -> (Arc<PipeReadEnd>, Arc<PipeWriteEnd>) {
    let shared = Arc::new(PipeShared {
        ring: Spinlock::new(ByteRing::new(capacity.clamp(512, 1 << 20))),
        data_event: Event::new(),
        space_event: Event::new(),
        reader_closed: AtomicBool::new(false),
        writer_closed: AtomicBool::new(false),
    });
    (
        Arc::new(PipeReadEnd {
            shared: shared.clone(),
        }),
        Arc::new(PipeWriteEnd { shared }),
    )
}

impl VNode for PipeReadEnd {
    fn read(&self, _offset: u64, buf: &mut [u8], flags: u32) -> SysResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut ring = self.shared.ring.lock();
                if !ring.is_empty() {
                    let n = ring.read(buf);
                    drop(ring);
                    self.shared.space_event.signal_one();
                    return Ok(n);
                }
            }
            if self.shared.writer_closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            if flags & OPEN_NON_BLOCK != 0 {
                return Err(SysError::TryAgain);
            }
            self.shared.data_event.wait();
        }
    }

    fn stat(&self) -> SysResult<FileStat> {
        Ok(FileStat {
            size: self.shared.ring.lock().len() as u64,
            is_dir: false,
        })
    }

    fn poll(&self) -> u32 {
        let mut mask = 0;
        if !self.shared.ring.lock().is_empty() {
            mask |= POLL_READABLE;
        }
        if self.shared.writer_closed.load(Ordering::SeqCst) {
            mask |= POLL_READABLE | POLL_CLOSED;
        }
        mask
    }
}

impl Drop for PipeReadEnd {
    fn drop(&mut self) {
        self.shared.reader_closed.store(true, Ordering::SeqCst);
        self.shared.space_event.signal_all();
    }
}

impl VNode for PipeWriteEnd {
    fn write(&self, _offset: u64, buf: &[u8], flags: u32) -> SysResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut written = 0;
        loop {
            if self.shared.reader_closed.load(Ordering::SeqCst) {
                return Err(SysError::ConnectionClosed);
            }
            {
                let mut ring = self.shared.ring.lock();
                let n = ring.write(&buf[written..]);
                written += n;
                if n > 0 {
                    drop(ring);
                    self.shared.data_event.signal_one();
                }
            }
            if written == buf.len() {
                return Ok(written);
            }
            if flags & OPEN_NON_BLOCK != 0 {
                if written > 0 {
                    return Ok(written);
                }
                return Err(SysError::TryAgain);
            }
            self.shared.space_event.wait();
        }
    }

    fn stat(&self) -> SysResult<FileStat> {
        Ok(FileStat {
            size: self.shared.ring.lock().len() as u64,
            is_dir: false,
        })
    }

    fn poll(&self) -> u32 {
        let mut mask = 0;
        if !self.shared.ring.lock().is_full() {
            mask |= POLL_WRITABLE;
        }
        if self.shared.reader_closed.load(Ordering::SeqCst) {
            mask |= POLL_CLOSED;
        }
        mask
    }
}

impl Drop for PipeWriteEnd {
    fn drop(&mut self) {
        self.shared.writer_closed.store(true, Ordering::SeqCst);
        self.shared.data_event.signal_all();
    }
}
