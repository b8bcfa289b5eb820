//! Cross-layer memory scenarios: the global buddy zone feeding user address
//! spaces, and the allocator round-trip law at the public API.

#![cfg(not(target_os = "none"))]

use basalt_kernel::mm::{self, buddy, UserPageTable, PGSIZE};

/// These scenarios assert exact frame counts on the shared zone, so they
/// must not interleave.
fn zone_gate() -> std::sync::MutexGuard<'static, ()> {
    static GATE: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn global_alloc_free_round_trip_restores_availability() {
    let _zone = zone_gate();
    mm::test_support::init_test_zone();
    let before = buddy::available_pages();

    let a = buddy::alloc_pages(0).expect("order 0");
    let b = buddy::alloc_pages(3).expect("order 3");
    assert_eq!(buddy::available_pages(), before - 1 - 8);

    buddy::free_pages(a, 0);
    buddy::free_pages(b, 3);
    assert_eq!(buddy::available_pages(), before);
}

#[test]
fn recorded_order_drives_free_page() {
    let _zone = zone_gate();
    mm::test_support::init_test_zone();
    let before = buddy::available_pages();
    let block = buddy::alloc_pages(2).expect("order 2");
    buddy::free_page(block); // order comes from the frame metadata
    assert_eq!(buddy::available_pages(), before);
}

#[test]
fn address_spaces_draw_from_and_return_to_the_zone() {
    let _zone = zone_gate();
    mm::test_support::init_test_zone();
    let before = buddy::available_pages();

    let mut pt = UserPageTable::new().expect("table");
    let sz = pt.alloc(0, 6 * PGSIZE).expect("grow");
    assert_eq!(sz, 6 * PGSIZE);
    pt.copy_out(3 * PGSIZE + 17, b"deep in the image").expect("copy_out");

    let mut back = [0u8; 17];
    pt.copy_in(&mut back, 3 * PGSIZE + 17).expect("copy_in");
    assert_eq!(&back, b"deep in the image");

    pt.destroy();
    assert_eq!(
        buddy::available_pages(),
        before,
        "destroy returns data and table frames alike"
    );
}

#[test]
fn fork_style_copy_duplicates_frames() {
    let _zone = zone_gate();
    mm::test_support::init_test_zone();
    let before = buddy::available_pages();

    let mut parent = UserPageTable::new().expect("parent");
    parent.alloc(0, 2 * PGSIZE).expect("grow");
    parent.copy_out(10, b"genes").expect("seed");

    let mut child = UserPageTable::new().expect("child");
    parent.copy_to(&mut child, 2 * PGSIZE).expect("uvmcopy");

    let mut buf = [0u8; 5];
    child.copy_in(&mut buf, 10).expect("inherited");
    assert_eq!(&buf, b"genes");

    parent.destroy();
    child.destroy();
    assert_eq!(buddy::available_pages(), before);
}
