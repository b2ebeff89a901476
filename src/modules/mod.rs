//! Per-frame pipeline stages and their dispatch verdicts.
//!
//! Every incoming frame walks the network's module chain in order. The
//! first module that claims the frame supplies the bytes to deliver and a
//! verdict naming the recipients; a module that declines passes the frame
//! to the next stage. Modules are synchronous and never suspend.

pub mod dhcp;
pub mod dns;
pub mod learning;
pub mod switch;

pub use dhcp::DhcpModule;
pub use dns::DnsModule;
pub use learning::LearningModule;
pub use switch::SwitchModule;

use std::sync::Arc;

use crate::error::Result;
use crate::registry::Client;

/// Where the fabric should deliver a claimed frame.
pub enum Verdict {
    /// Drop the frame.
    None,
    /// Deliver to the guest the frame came from.
    Sender,
    /// Deliver to one specific guest.
    Explicit(Arc<Client>),
    /// Deliver to every guest, including the sender.
    Broadcast,
    /// Deliver to every guest except the sender.
    Others,
}

/// A claimed frame's dispatch: the bytes to deliver and the recipients.
pub struct Dispatch {
    pub payload: Vec<u8>,
    pub verdict: Verdict,
}

impl Dispatch {
    pub fn new(payload: Vec<u8>, verdict: Verdict) -> Self {
        Dispatch { payload, verdict }
    }

    /// A claim that discards the frame.
    pub fn drop_frame() -> Self {
        Dispatch {
            payload: Vec::new(),
            verdict: Verdict::None,
        }
    }
}

/// Outcome of offering a frame to one module.
pub enum ModuleStatus {
    /// The module claimed the frame and produced a definitive dispatch.
    Claimed(Dispatch),
    /// The module declined; the next stage in the chain sees the frame.
    Declined,
}

/// One stage of a network's module chain.
///
/// A closed set instead of trait objects keeps dispatch in the listener's
/// read loop a plain match.
pub enum NetworkModule {
    Learning(LearningModule),
    Dhcp(DhcpModule),
    Dns(DnsModule),
    Switch(SwitchModule),
}

impl NetworkModule {
    /// Offer a frame to this stage. An error ends the chain and drops the
    /// frame; truncated frames and unsupported message types land here.
    pub fn handle(&self, frame: &[u8]) -> Result<ModuleStatus> {
        match self {
            NetworkModule::Learning(m) => m.handle(frame),
            NetworkModule::Dhcp(m) => m.handle(frame),
            NetworkModule::Dns(m) => m.handle(frame),
            NetworkModule::Switch(m) => m.handle(frame),
        }
    }

    /// Reclaim any per-guest resources when a guest detaches.
    pub fn on_detach(&self, client: &Client) {
        match self {
            NetworkModule::Dhcp(m) => m.on_detach(client),
            NetworkModule::Learning(_) | NetworkModule::Dns(_) | NetworkModule::Switch(_) => {}
        }
    }
}
