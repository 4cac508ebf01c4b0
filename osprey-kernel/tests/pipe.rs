#![no_std]
#![no_main]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;

use osprey_abi::SysError;
use osprey_abi::io::OPEN_NON_BLOCK;
use osprey_kernel::sched::thread::{Thread, ThreadEntry};
use osprey_kernel::vfs::{OpenFile, create_pipe};
use osprey_kernel::{cpu, sched};

osprey_kernel::test_harness!(
    ping_pong_round_trips,
    non_blocking_empty_read_is_try_again,
    writer_close_drains_to_eof,
    reader_close_fails_the_writer,
    blocked_reader_wakes_on_write,
);

fn ping_pong_round_trips() {
    let (read_end, write_end) = create_pipe(4096);
    let reader = OpenFile::new(read_end, 0);
    let writer = OpenFile::new(write_end, 0);

    assert_eq!(writer.write(b"ping").unwrap(), 4);
    let mut buf = [0u8; 4];
    assert_eq!(reader.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"ping");
}

fn non_blocking_empty_read_is_try_again() {
    let (read_end, _write_end) = create_pipe(4096);
    let reader = OpenFile::new(read_end, OPEN_NON_BLOCK);
    let mut buf = [0u8; 16];
    assert_eq!(reader.read(&mut buf), Err(SysError::TryAgain));
}

fn writer_close_drains_to_eof() {
    let (read_end, write_end) = create_pipe(4096);
    let reader = OpenFile::new(read_end, 0);
    let writer = OpenFile::new(write_end, 0);

    writer.write(b"tail").unwrap();
    drop(writer);

    let mut buf = [0u8; 16];
    assert_eq!(reader.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"tail");
    // Writer gone and the ring drained: EOF.
    assert_eq!(reader.read(&mut buf).unwrap(), 0);
}

fn reader_close_fails_the_writer() {
    let (read_end, write_end) = create_pipe(4096);
    let writer = OpenFile::new(write_end, 0);
    drop(OpenFile::new(read_end, 0));

    assert_eq!(writer.write(b"x"), Err(SysError::ConnectionClosed));
}

fn blocked_reader_wakes_on_write() {
    let (read_end, write_end) = create_pipe(4096);
    let reader = OpenFile::new(read_end, 0);
    let writer = Arc::new(OpenFile::new(write_end, 0));

    let thread_writer = writer.clone();
    let thread = Thread::new(
        "pipe writer",
        cpu::current_cpu(),
        sched::kernel_process(),
        ThreadEntry::Kernel(Box::new(move || {
            sched::sleep_us(20_000);
            thread_writer.write(b"late").unwrap();
        })),
    );
    sched::spawn(&thread);

    let mut buf = [0u8; 4];
    assert_eq!(reader.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"late");
}
