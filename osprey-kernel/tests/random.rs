#![no_std]
#![no_main]

extern crate alloc;

use osprey_kernel::random;

osprey_kernel::test_harness!(
    streams_do_not_repeat,
    bulk_output_is_not_degenerate,
    words_vary,
);

fn streams_do_not_repeat() {
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    random::generate(&mut a);
    random::generate(&mut b);
    // Distinct nonces guarantee distinct streams even from an
    // identical pool state.
    assert_ne!(a, b);
}

fn bulk_output_is_not_degenerate() {
    let mut buf = [0u8; 1024];
    random::generate(&mut buf);

    // A keyed ChaCha20 stream cannot be all one value, and its byte
    // histogram cannot be wildly skewed.
    let first = buf[0];
    assert!(buf.iter().any(|&b| b != first));

    let zeros = buf.iter().filter(|&&b| b == 0).count();
    assert!(zeros < 64, "suspiciously many zero bytes: {zeros}");
}

fn words_vary() {
    let a = random::random_u64();
    let b = random::random_u64();
    let c = random::random_u64();
    assert!(a != b || b != c, "three identical words in a row");

    random::add_entropy(&[0x1234_5678_9abc_def0]);
    let d = random::random_u32();
    let e = random::random_u32();
    assert!(d != e || d != a as u32);
}
