//! User-region tests: pinning modes, the demand-pin state machine, the
//! vectored offset cache, and invalidation on unmap.

use omx_abi::cmd::{CreateUserRegion, UserSegment};

use omx_mm::PAGE_SIZE;

use crate::region::{demand_pin_finish, fill_pages, OffsetCache, RegionStatus};
use crate::test_fixtures::{rig, rig_with_config};
use crate::{OmxConfig, OmxError};

const VADDR: u64 = 0x40_0000;

fn one_segment(vaddr: u64, len: u64) -> Vec<UserSegment> {
    vec![UserSegment { vaddr, len }]
}

#[test]
fn synchronous_pin_covers_the_region_at_creation() {
    let rig = rig_with_config(OmxConfig {
        pin_synchronous: true,
        ..OmxConfig::default()
    });
    let (endpoint, vm) = rig.open(rig.board_a, 0);
    vm.map(VADDR, 6 * PAGE_SIZE).unwrap();

    rig.driver
        .create_user_region(
            &endpoint,
            &CreateUserRegion {
                id: 0,
                seqnum: 0,
                segments: one_segment(VADDR, 6 * PAGE_SIZE as u64),
            },
        )
        .unwrap();

    let region = endpoint.regions.acquire(0).unwrap();
    assert_eq!(region.status(), RegionStatus::Pinned);
    assert_eq!(region.total_registered_length(), 6 * PAGE_SIZE as u64);
}

#[test]
fn duplicate_region_id_is_rejected() {
    let rig = rig();
    let (endpoint, vm) = rig.open(rig.board_a, 0);
    vm.map(VADDR, PAGE_SIZE).unwrap();

    let cmd = CreateUserRegion {
        id: 3,
        seqnum: 0,
        segments: one_segment(VADDR, PAGE_SIZE as u64),
    };
    rig.driver.create_user_region(&endpoint, &cmd).unwrap();
    assert_eq!(
        rig.driver.create_user_region(&endpoint, &cmd),
        Err(OmxError::Busy)
    );
}

#[test]
fn demand_pin_elects_one_pinner_and_watchers_see_progress() {
    let rig = rig();
    let (endpoint, vm) = rig.open(rig.board_a, 0);
    let len = 40 * PAGE_SIZE;
    vm.map(VADDR, len).unwrap();

    rig.driver
        .create_user_region(
            &endpoint,
            &CreateUserRegion {
                id: 0,
                seqnum: 0,
                segments: one_segment(VADDR, len as u64),
            },
        )
        .unwrap();
    let region = endpoint.regions.acquire(0).unwrap();
    assert_eq!(region.status(), RegionStatus::NotPinned);

    // First finisher wins the CAS and pins everything.
    demand_pin_finish(&region, &rig.driver.config).unwrap();
    assert_eq!(region.status(), RegionStatus::Pinned);
    assert_eq!(region.total_registered_length(), len as u64);

    // A second finisher is a watcher; the prefix is already covered.
    demand_pin_finish(&region, &rig.driver.config).unwrap();
    assert_eq!(region.total_registered_length(), len as u64);
}

#[test]
fn demand_pin_failure_is_sticky() {
    let rig = rig();
    let (endpoint, vm) = rig.open(rig.board_a, 0);
    // Only the first half of the region is actually mapped.
    vm.map(VADDR, 4 * PAGE_SIZE).unwrap();

    rig.driver
        .create_user_region(
            &endpoint,
            &CreateUserRegion {
                id: 0,
                seqnum: 0,
                segments: one_segment(VADDR, 8 * PAGE_SIZE as u64),
            },
        )
        .unwrap();
    let region = endpoint.regions.acquire(0).unwrap();

    assert_eq!(
        demand_pin_finish(&region, &rig.driver.config),
        Err(OmxError::Fault)
    );
    assert_eq!(region.status(), RegionStatus::Failed);

    // Watchers observe the failure instead of spinning for ever.
    assert_eq!(
        demand_pin_finish(&region, &rig.driver.config),
        Err(OmxError::Fault)
    );
}

#[test]
fn vectored_offset_cache_crosses_segments() {
    let rig = rig();
    let (endpoint, vm) = rig.open(rig.board_a, 0);

    // Two segments with unaligned starts and lengths.
    let seg_a = UserSegment {
        vaddr: VADDR + 100,
        len: (PAGE_SIZE + 300) as u64,
    };
    let seg_b = UserSegment {
        vaddr: VADDR + 0x10_0000 + 17,
        len: (2 * PAGE_SIZE) as u64,
    };
    vm.map(seg_a.vaddr, seg_a.len as usize).unwrap();
    vm.map(seg_b.vaddr, seg_b.len as usize).unwrap();

    rig.driver
        .create_user_region(
            &endpoint,
            &CreateUserRegion {
                id: 0,
                seqnum: 0,
                segments: vec![seg_a, seg_b],
            },
        )
        .unwrap();
    let region = endpoint.regions.acquire(0).unwrap();
    demand_pin_finish(&region, &rig.driver.config).unwrap();

    // Fill a range spanning the segment boundary, read it back through
    // a fresh cursor.
    let total = (seg_a.len + seg_b.len) as usize;
    let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    fill_pages(&region, 0, &data).unwrap();

    let mut cache = OffsetCache::init(&region, 0, total as u64).unwrap();
    let mut readback = vec![0u8; total];
    cache.copy_to_buf(&mut readback);
    assert_eq!(readback, data);

    // Out-of-bounds windows are refused at cache init.
    assert!(OffsetCache::init(&region, 1, total as u64).is_err());
}

#[test]
fn unmap_invalidates_intersecting_regions() {
    let rig = rig();
    let (endpoint, vm) = rig.open(rig.board_a, 0);
    let len = 8 * PAGE_SIZE;
    vm.map(VADDR, len).unwrap();

    rig.driver
        .create_user_region(
            &endpoint,
            &CreateUserRegion {
                id: 0,
                seqnum: 0,
                segments: one_segment(VADDR, len as u64),
            },
        )
        .unwrap();
    let region = endpoint.regions.acquire(0).unwrap();
    demand_pin_finish(&region, &rig.driver.config).unwrap();
    assert_eq!(region.status(), RegionStatus::Pinned);

    // Unmapping part of the backing range quiesces the region.
    vm.unmap(VADDR + 2 * PAGE_SIZE as u64, PAGE_SIZE);
    assert_eq!(region.status(), RegionStatus::NotPinned);
    assert_eq!(region.total_registered_length(), 0);

    // An unrelated range leaves other regions alone.
    vm.map(VADDR, len).unwrap();
    demand_pin_finish(&region, &rig.driver.config).unwrap();
    vm.unmap(VADDR + 0x100_0000, PAGE_SIZE);
    assert_eq!(region.status(), RegionStatus::Pinned);
}

#[test]
fn pin_watcher_losing_an_invalidation_race_must_retry() {
    let rig = rig();
    let (endpoint, vm) = rig.open(rig.board_a, 0);
    let len = 4 * PAGE_SIZE;
    vm.map(VADDR, len).unwrap();

    rig.driver
        .create_user_region(
            &endpoint,
            &CreateUserRegion {
                id: 0,
                seqnum: 0,
                segments: one_segment(VADDR, len as u64),
            },
        )
        .unwrap();
    let region = endpoint.regions.acquire(0).unwrap();
    demand_pin_finish(&region, &rig.driver.config).unwrap();

    // The region is quiesced while a watcher would have been waiting on
    // its coverage: the watcher reports the race instead of trusting a
    // reset counter.
    vm.unmap(VADDR, PAGE_SIZE);
    assert_eq!(region.status(), RegionStatus::NotPinned);
    assert_eq!(region.parallel_pin_wait(len as u64), Err(OmxError::Race));

    // Retrying re-elects a pinner once the range is mapped again.
    vm.map(VADDR, len).unwrap();
    demand_pin_finish(&region, &rig.driver.config).unwrap();
    assert_eq!(region.status(), RegionStatus::Pinned);
}
