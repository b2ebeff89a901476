//! Switch module.
//!
//! Terminal stage of the chain: resolves the Ethernet destination to a
//! recipient after the service modules have declined. Frames to unknown
//! unicast destinations are dropped rather than flooded.

use std::sync::Arc;

use smoltcp::wire::EthernetFrame;

use crate::addr;
use crate::error::{Error, Result};
use crate::modules::{Dispatch, ModuleStatus, Verdict};
use crate::registry::ClientRegistry;

pub struct SwitchModule {
    registry: Arc<ClientRegistry>,
}

impl SwitchModule {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        SwitchModule { registry }
    }

    pub fn handle(&self, frame: &[u8]) -> Result<ModuleStatus> {
        let eth = EthernetFrame::new_checked(frame)
            .map_err(|_| Error::ParseError("Ethernet".into()))?;
        let dst = eth.dst_addr();

        if addr::is_broadcast_mac(dst) {
            return Ok(ModuleStatus::Claimed(Dispatch::new(
                frame.to_vec(),
                Verdict::Broadcast,
            )));
        }

        match self.registry.by_mac(dst) {
            Ok(client) => Ok(ModuleStatus::Claimed(Dispatch::new(
                frame.to_vec(),
                Verdict::Explicit(client),
            ))),
            Err(_) => Ok(ModuleStatus::Claimed(Dispatch::drop_frame())),
        }
    }
}
