//! Peer table: fabric-wide index ↔ board address mapping.
//!
//! The table itself belongs to the fabric mapper (an external
//! collaborator); the transport only consults it.  Every non-connect
//! packet carries the sender's peer index, which each handler validates
//! against the frame's source MAC via [`PeerTable::check_recv_peer_index`]
//! before trusting anything else in the packet.  Connect packets do the
//! reverse lookup by address, since the sender may not know its index yet.

use spin::RwLock;

use omx_abi::cmd::{PeerInfo, PeerTableState, PeerTableStatus};

use crate::wire::MacAddr;
use crate::OmxError;

/// Default table size; the wire allows indices up to 65535.
pub const PEER_TABLE_SIZE_DEFAULT: usize = 1024;

#[derive(Clone, Debug)]
struct Peer {
    addr: u64,
    hostname: Option<String>,
}

struct PeerTableInner {
    slots: Vec<Option<Peer>>,
    count: u32,
    status: PeerTableStatus,
    version: u32,
    mapper_id: u64,
}

/// The driver's view of the fabric peer table.
pub struct PeerTable {
    inner: RwLock<PeerTableInner>,
}

impl PeerTable {
    pub fn new(size: usize) -> Self {
        Self {
            inner: RwLock::new(PeerTableInner {
                slots: vec![None; size],
                count: 0,
                status: PeerTableStatus::empty(),
                version: 0,
                mapper_id: 0,
            }),
        }
    }

    /// Insert a peer at `index` (or the first free slot when `index` is
    /// `None`).
    pub fn add(&self, addr: u64, hostname: Option<String>, index: Option<u32>) -> Result<u32, OmxError> {
        let mut inner = self.inner.write();
        let free_slot = inner.slots.iter().position(|s| s.is_none());
        let idx = match index {
            Some(idx) => {
                let idx = idx as usize;
                if idx >= inner.slots.len() {
                    return Err(OmxError::Invalid);
                }
                idx
            }
            None => match free_slot {
                Some(idx) => idx,
                None => {
                    inner.status.insert(PeerTableStatus::FULL);
                    return Err(OmxError::Nomem);
                }
            },
        };
        if inner.slots[idx].is_none() {
            inner.count += 1;
        }
        inner.slots[idx] = Some(Peer { addr, hostname });
        Ok(idx as u32)
    }

    /// Validate that `peer_index` really maps to `src_addr`.
    pub fn check_recv_peer_index(&self, peer_index: u16, src_addr: u64) -> Result<(), OmxError> {
        let inner = self.inner.read();
        match inner.slots.get(peer_index as usize) {
            Some(Some(peer)) if peer.addr == src_addr => Ok(()),
            _ => Err(OmxError::Invalid),
        }
    }

    pub fn lookup_by_index(&self, index: u32) -> Option<PeerInfo> {
        let inner = self.inner.read();
        inner
            .slots
            .get(index as usize)?
            .as_ref()
            .map(|p| PeerInfo {
                board_addr: p.addr,
                hostname: p.hostname.clone(),
                index,
            })
    }

    pub fn lookup_by_addr(&self, addr: u64) -> Option<PeerInfo> {
        let inner = self.inner.read();
        inner.slots.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref().filter(|p| p.addr == addr).map(|p| PeerInfo {
                board_addr: p.addr,
                hostname: p.hostname.clone(),
                index: i as u32,
            })
        })
    }

    pub fn lookup_by_hostname(&self, hostname: &str) -> Option<PeerInfo> {
        let inner = self.inner.read();
        inner.slots.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|p| p.hostname.as_deref() == Some(hostname))
                .map(|p| PeerInfo {
                    board_addr: p.addr,
                    hostname: p.hostname.clone(),
                    index: i as u32,
                })
        })
    }

    /// MAC address of peer `index`, for filling transmit heads.
    pub fn mac_of(&self, index: u16) -> Option<MacAddr> {
        let inner = self.inner.read();
        inner
            .slots
            .get(index as usize)?
            .as_ref()
            .map(|p| MacAddr::from_u64(p.addr))
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.slots.iter_mut().for_each(|s| *s = None);
        inner.count = 0;
        inner.status.remove(PeerTableStatus::FULL);
        inner.version += 1;
    }

    pub fn clear_names(&self) {
        let mut inner = self.inner.write();
        for slot in inner.slots.iter_mut().flatten() {
            slot.hostname = None;
        }
        inner.version += 1;
    }

    pub fn get_state(&self) -> PeerTableState {
        let inner = self.inner.read();
        PeerTableState {
            status: inner.status,
            version: inner.version,
            size: inner.slots.len() as u32,
            mapper_id: inner.mapper_id,
        }
    }

    pub fn set_state(&self, state: &PeerTableState) {
        let mut inner = self.inner.write();
        inner.status = (inner.status & !PeerTableStatus::SETMASK)
            | (state.status & PeerTableStatus::SETMASK);
        inner.version = state.version;
        inner.mapper_id = state.mapper_id;
    }

    pub fn count(&self) -> u32 {
        self.inner.read().count
    }
}

impl core::fmt::Debug for PeerTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PeerTable({} peers)", self.count())
    }
}
