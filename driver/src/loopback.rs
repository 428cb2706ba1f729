//! Loopback fabric: an in-process Ethernet substrate.
//!
//! A [`Fabric`] connects any number of ports; each port is a
//! [`NetDevice`] attached to a driver board.  Transmitting on a port
//! linearizes the frame (that is the "wire") and classifies it into the
//! destination port's interface, selected by destination MAC.
//!
//! A drop hook can be installed to simulate a lossy wire; the
//! loss-recovery integration tests drive retransmission with it.
//!
//! # Reentrancy
//!
//! Delivery happens synchronously inside `tx`, so a receive handler that
//! nacks will reenter `tx` on the same call stack.  The fabric never
//! holds its own lock across delivery, and the transport never holds a
//! handle or endpoint lock across `tx`.

use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::frame::FrameBuf;
use crate::iface::NetDevice;
use crate::wire::{MacAddr, OMX_MTU};
use crate::{Driver, OmxError};

/// Decides whether a wire frame is lost; `true` drops it.
pub type DropHook = Box<dyn FnMut(&[u8]) -> bool + Send>;

struct PortEntry {
    mac: MacAddr,
    driver: Weak<Driver>,
    board_index: u32,
}

struct FabricInner {
    ports: Vec<PortEntry>,
    drop_hook: Option<DropHook>,
}

/// An in-process fabric connecting driver boards.
pub struct Fabric {
    weak_self: Weak<Fabric>,
    inner: Mutex<FabricInner>,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            inner: Mutex::new(FabricInner {
                ports: Vec::new(),
                drop_hook: None,
            }),
        })
    }

    /// Create a port with `mac`, attach it to `driver` as a new board,
    /// and connect it to the fabric.  Returns the board index.
    pub fn attach(
        &self,
        driver: &Arc<Driver>,
        mac: MacAddr,
        name: &str,
    ) -> Result<u32, OmxError> {
        let port = Arc::new(FabricPort {
            fabric: self.weak_self.clone(),
            mac,
            name: name.to_string(),
        });
        let board_index = driver.attach_iface(port, "omx_fabric")?;
        self.inner.lock().ports.push(PortEntry {
            mac,
            driver: Arc::downgrade(driver),
            board_index,
        });
        Ok(board_index)
    }

    /// Install (or clear) the loss-injection hook.
    pub fn set_drop_hook(&self, hook: Option<DropHook>) {
        self.inner.lock().drop_hook = Some(hook).flatten();
    }

    fn deliver(&self, bytes: &[u8]) {
        if bytes.len() < 6 {
            return;
        }
        let mut dst = [0u8; 6];
        dst.copy_from_slice(&bytes[0..6]);
        let dst = MacAddr(dst);

        // Consult the hook and resolve the target under the lock, then
        // deliver outside it: the receive path may transmit (nacks, pull
        // replies) and reenter the fabric.
        let target = {
            let mut inner = self.inner.lock();
            if let Some(hook) = inner.drop_hook.as_mut() {
                if hook(bytes) {
                    return;
                }
            }
            inner
                .ports
                .iter()
                .find(|p| p.mac == dst)
                .map(|p| (p.driver.clone(), p.board_index))
        };

        if let Some((driver, board_index)) = target {
            if let Some(driver) = driver.upgrade() {
                driver.recv(board_index, bytes);
            }
        }
    }
}

impl core::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Fabric({} ports)", self.inner.lock().ports.len())
    }
}

/// One fabric attachment, used as the NIC of a board.
pub struct FabricPort {
    fabric: Weak<Fabric>,
    mac: MacAddr,
    name: String,
}

impl NetDevice for FabricPort {
    fn tx(&self, frame: FrameBuf) -> Result<(), OmxError> {
        // Linearizing is the wire: page fragments are consumed here, and
        // the frame (with its region reference) is released on return.
        let bytes = frame.to_wire_bytes();
        if let Some(fabric) = self.fabric.upgrade() {
            fabric.deliver(&bytes);
        }
        Ok(())
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn mtu(&self) -> u16 {
        OMX_MTU as u16
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
