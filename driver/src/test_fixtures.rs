//! Shared fixtures for the in-crate tests: a two-board driver on a
//! loopback fabric with both boards registered in the peer table.

use std::sync::Arc;

use omx_mm::UserVm;

use crate::endpoint::Endpoint;
use crate::loopback::Fabric;
use crate::wire::MacAddr;
use crate::{Driver, OmxConfig};

pub(crate) const MAC_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
pub(crate) const MAC_B: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);

/// Peer indices of the two boards in the shared table.
pub(crate) const PEER_A: u16 = 5;
pub(crate) const PEER_B: u16 = 7;

pub(crate) struct TestRig {
    pub fabric: Arc<Fabric>,
    pub driver: Arc<Driver>,
    pub board_a: u32,
    pub board_b: u32,
}

pub(crate) fn rig() -> TestRig {
    rig_with_config(OmxConfig::default())
}

pub(crate) fn rig_with_config(config: OmxConfig) -> TestRig {
    let driver = Driver::new(config);
    let fabric = Fabric::new();
    let board_a = fabric.attach(&driver, MAC_A, "fab0").unwrap();
    let board_b = fabric.attach(&driver, MAC_B, "fab1").unwrap();
    driver
        .peer_add(MAC_A.to_u64(), Some("hosta".to_string()), Some(PEER_A as u32))
        .unwrap();
    driver
        .peer_add(MAC_B.to_u64(), Some("hostb".to_string()), Some(PEER_B as u32))
        .unwrap();
    TestRig {
        fabric,
        driver,
        board_a,
        board_b,
    }
}

impl TestRig {
    /// Open an endpoint backed by a fresh address space.
    pub fn open(&self, board_index: u32, endpoint_index: u8) -> (Arc<Endpoint>, Arc<UserVm>) {
        let vm = Arc::new(UserVm::new());
        let endpoint = self
            .driver
            .open_endpoint(board_index, endpoint_index, vm.clone(), 1234, "testprog")
            .unwrap();
        (endpoint, vm)
    }
}
