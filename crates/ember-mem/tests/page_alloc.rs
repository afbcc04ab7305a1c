use ember_mem::{MemHandle, MemoryConfig, MemorySystem, XMS_START};
use proptest::prelude::*;

fn mem(memsize_mb: u32) -> MemorySystem {
    MemorySystem::new(MemoryConfig {
        memsize_mb,
        address_bits: 32,
        ..MemoryConfig::default()
    })
    .unwrap()
}

fn chain(mem: &MemorySystem, handle: MemHandle) -> Vec<MemHandle> {
    let mut pages = Vec::new();
    let mut h = handle;
    while h > 0 {
        pages.push(h);
        h = mem.next_handle(h);
    }
    pages
}

#[test]
fn sequential_chains_are_contiguous() {
    let mut mem = mem(8);
    let total = mem.free_total();
    assert_eq!(total, mem.total_pages() - XMS_START);

    let handle = mem.allocate_pages(10, true);
    assert!(handle > 0);
    let pages = chain(&mem, handle);
    assert_eq!(pages.len(), 10);
    for w in pages.windows(2) {
        assert_eq!(w[1], w[0] + 1);
    }
    assert_eq!(mem.allocated_pages(handle), 10);
    assert_eq!(mem.free_total(), total - 10);

    mem.release_pages(handle);
    assert_eq!(mem.free_total(), total);
}

#[test]
fn release_reuses_the_best_fitting_run() {
    let mut mem = mem(8);

    let h1 = mem.allocate_pages(10, true);
    let h2 = mem.allocate_pages(5, true);
    assert!(h1 > 0 && h2 > 0);

    mem.release_pages(h1);
    let h3 = mem.allocate_pages(7, true);

    // The freed 10-page run is the best fit for 7 pages; h3 must reuse its
    // start.
    assert_eq!(h3, h1);
    assert_eq!(chain(&mem, h3).len(), 7);

    // The remainder of the freed run (3 pages) plus the tail after h2 are
    // the free blocks left; the largest is the open tail.
    let largest = mem.free_largest();
    assert_eq!(largest, mem.total_pages() - XMS_START - 10 - 5);
}

#[test]
fn exact_fit_wins_over_larger_runs() {
    let mut mem = mem(8);

    // Carve the space into a 4-page hole and the open tail.
    let a = mem.allocate_pages(4, true);
    let guard = mem.allocate_pages(1, true);
    mem.release_pages(a);

    let b = mem.allocate_pages(4, true);
    assert_eq!(b, a, "exact-size hole beats the open tail");
    let _ = guard;
}

#[test]
fn scattered_allocation_chains_free_fragments() {
    let mut mem = mem(8);

    let a = mem.allocate_pages(3, true);
    let b = mem.allocate_pages(3, true);
    let c = mem.allocate_pages(3, true);
    assert!(a > 0 && b > 0 && c > 0);
    mem.release_pages(a);
    mem.release_pages(c);

    // 3 + 3 free in two fragments plus the tail; a scattered request may
    // span them.
    let total_before = mem.free_total();
    let h = mem.allocate_pages(total_before, false);
    assert!(h > 0);
    assert_eq!(mem.allocated_pages(h), total_before);
    assert_eq!(mem.free_total(), 0);

    // Over-allocation fails cleanly.
    assert_eq!(mem.allocate_pages(1, false), 0);
    mem.release_pages(h);
    let _ = b;
}

#[test]
fn a20_friendly_chains_avoid_odd_megabytes() {
    let mut mem = mem(8);

    // Consume space until allocations land near the odd-megabyte boundary.
    let filler = mem.allocate_pages(0xE0, true);
    assert!(filler > 0);

    let h = mem.allocate_pages_a20_friendly(64, true);
    assert!(h > 0);
    for page in chain(&mem, h) {
        assert_eq!(page & 0x100, 0, "page {page:#x} has bit 20 set");
    }

    // Scattered requests obey the same restriction.
    let h2 = mem.allocate_pages_a20_friendly(32, false);
    assert!(h2 > 0);
    for page in chain(&mem, h2) {
        assert_eq!(page & 0x100, 0);
    }

    // More than 1 MiB can never be satisfied.
    assert_eq!(mem.allocate_pages_a20_friendly(0x101, true), 0);
}

#[test]
fn reallocate_shrinks_in_place() {
    let mut mem = mem(8);
    let mut h = mem.allocate_pages(10, true);
    let first = h;

    assert!(mem.reallocate_pages(&mut h, 4, true));
    assert_eq!(h, first);
    assert_eq!(mem.allocated_pages(h), 4);

    // The freed tail is allocatable again.
    let tail = mem.allocate_pages(6, true);
    assert_eq!(tail, first + 4);
}

#[test]
fn reallocate_grows_in_place_when_room_follows() {
    let mut mem = mem(8);
    let mut h = mem.allocate_pages(4, true);
    let first = h;

    assert!(mem.reallocate_pages(&mut h, 9, true));
    assert_eq!(h, first);
    let pages = chain(&mem, h);
    assert_eq!(pages.len(), 9);
    for w in pages.windows(2) {
        assert_eq!(w[1], w[0] + 1);
    }
}

#[test]
fn reallocate_moves_and_preserves_contents() {
    let mut mem = mem(8);
    // Extended memory is normally touched with the gate open (HIMEM turns
    // it on before handing out XMS blocks).
    mem.a20_enable(true);
    let mut h = mem.allocate_pages(2, true);
    let blocker = mem.allocate_pages(1, true);
    assert_eq!(blocker, h + 2, "blocker must sit right behind the chain");

    // Tag the allocation so the copy is observable.
    let payload = [0xDE, 0xAD, 0xBE, 0xEF];
    mem.block_write((h as u32) << 12, &payload);

    let old = h;
    assert!(mem.reallocate_pages(&mut h, 6, true));
    assert_ne!(h, old, "no room in place, the chain must move");
    assert_eq!(mem.allocated_pages(h), 6);

    let mut readback = [0u8; 4];
    mem.block_read((h as u32) << 12, &mut readback);
    assert_eq!(readback, payload);

    // The old pages went back to the free map.
    let reuse = mem.allocate_pages(2, true);
    assert_eq!(reuse, old);
}

#[test]
fn reallocate_appends_a_segment_for_scattered_chains() {
    let mut mem = mem(8);
    let mut h = mem.allocate_pages(2, true);
    let blocker = mem.allocate_pages(1, true);

    assert!(mem.reallocate_pages(&mut h, 5, false));
    assert_eq!(mem.allocated_pages(h), 5);
    // In-place extension was blocked, so the chain is non-contiguous.
    let pages = chain(&mem, h);
    assert!(pages.windows(2).any(|w| w[1] != w[0] + 1));
    let _ = blocker;
}

#[test]
fn reallocate_to_zero_releases() {
    let mut mem = mem(8);
    let total = mem.free_total();
    let mut h = mem.allocate_pages(8, true);
    assert!(mem.reallocate_pages(&mut h, 0, true));
    assert_eq!(h, -1);
    assert_eq!(mem.free_total(), total);
}

#[test]
fn next_handle_walks_the_chain() {
    let mut mem = mem(8);
    let h = mem.allocate_pages(5, true);
    assert_eq!(mem.next_handle_at(h, 0), h);
    assert_eq!(mem.next_handle_at(h, 4), h + 4);
    assert_eq!(mem.next_handle(h + 4), -1);
    assert_eq!(mem.next_free_page(), h + 5);
}

#[test]
fn zero_page_requests_return_no_handle() {
    let mut mem = mem(8);
    assert_eq!(mem.allocate_pages(0, true), 0);
    assert_eq!(mem.allocate_pages(0, false), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Allocating and releasing any mix of chains restores the free map.
    #[test]
    fn alloc_release_round_trip(
        sizes in prop::collection::vec(1u32..48, 1..12),
        sequence in prop::collection::vec(any::<bool>(), 12),
    ) {
        let mut mem = mem(8);
        let total = mem.free_total();

        let mut handles = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let h = mem.allocate_pages(size, sequence[i % sequence.len()]);
            if h > 0 {
                prop_assert_eq!(mem.allocated_pages(h), size);
                handles.push(h);
            }
        }

        // Free total plus everything allocated covers the whole arena.
        let allocated: u32 = handles.iter().map(|&h| mem.allocated_pages(h)).sum();
        prop_assert_eq!(mem.free_total() + allocated, total);

        for h in handles {
            mem.release_pages(h);
        }
        prop_assert_eq!(mem.free_total(), total);
        prop_assert_eq!(mem.free_largest(), total);
    }
}
