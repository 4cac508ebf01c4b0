#![no_std]
#![no_main]

extern crate alloc;

use alloc::sync::Arc;

use osprey_kernel::handle::{HandleTable, Object};
use osprey_kernel::vfs::{OpenFile, console_vnode};

osprey_kernel::test_harness!(
    insert_returns_stable_handles,
    remove_frees_the_slot_for_reissue,
    get_after_remove_fails,
    remove_drops_the_last_reference,
    typed_accessors_check_the_kind,
);

fn file_object() -> Object {
    Object::OpenFile(Arc::new(OpenFile::new(console_vnode(), 0)))
}

fn insert_returns_stable_handles() {
    let table = HandleTable::new();
    let a = table.insert(file_object());
    let b = table.insert(file_object());
    assert_ne!(a, b);
    assert!(table.get(a).is_ok());
    assert!(table.get(b).is_ok());
    // Values stay valid while entries live.
    assert!(table.get(a).is_ok());
}

fn remove_frees_the_slot_for_reissue() {
    let table = HandleTable::new();
    let a = table.insert(file_object());
    let b = table.insert(file_object());
    table.remove(a).unwrap();
    let c = table.insert(file_object());
    assert_eq!(c, a, "freed index is reissued");
    assert_ne!(c, b);
}

fn get_after_remove_fails() {
    let table = HandleTable::new();
    let a = table.insert(file_object());
    table.remove(a).unwrap();
    assert!(table.get(a).is_err());
    assert!(table.remove(a).is_err());
}

fn remove_drops_the_last_reference() {
    let table = HandleTable::new();
    let file = Arc::new(OpenFile::new(console_vnode(), 0));
    let weak = Arc::downgrade(&file);
    let handle = table.insert(Object::OpenFile(file));
    assert!(weak.upgrade().is_some());
    table.remove(handle).unwrap();
    assert!(weak.upgrade().is_none(), "table held the only reference");
}

fn typed_accessors_check_the_kind() {
    let table = HandleTable::new();
    let handle = table.insert(file_object());
    assert!(table.get_open_file(handle).is_ok());
    assert!(table.get_socket(handle).is_err());
    assert!(table.get_evm(handle).is_err());
}
