//! Async shell around the dispatcher
//!
//! [`run`] is the single task that owns an [`IsoManager`]. It multiplexes
//! host requests and link events into the dispatcher and forwards the
//! resulting control PDUs and notifications to their consumers. Running
//! everything on one task keeps every context single-owner; the
//! surrounding firmware only ever talks to the channels.
//!
//! # Architecture
//!
//! * host task -> [`IsoChannels::requests`] -> dispatcher
//! * link/radio task -> [`IsoChannels::events`] -> dispatcher
//! * dispatcher -> [`IsoChannels::tx`] -> transport task
//! * dispatcher -> [`IsoChannels::notifications`] -> host task
//!
//! # Usage
//!
//! ```rust,no_run
//! use lliso::baseband::IsoBaseband;
//! use lliso::cis::CisRole;
//! use lliso::processor::{self, IsoChannels};
//! use lliso::{IsoManager, IsoOptions};
//!
//! async fn controller_task<B: IsoBaseband>(bb: &mut B) -> ! {
//!     let channels = IsoChannels::new();
//!     let mut mgr = IsoManager::new(IsoOptions::default(), CisRole::Central);
//!     processor::run(&mut mgr, &channels, bb).await
//! }
//! ```

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;

use crate::baseband::IsoBaseband;
use crate::constants::{
    EVENT_QUEUE_DEPTH, NOTIF_QUEUE_DEPTH, REQUEST_QUEUE_DEPTH, TX_QUEUE_DEPTH,
};
use crate::manager::{IsoManager, PduOut};
use crate::{HostEvent, HostRequest, LinkEvent};

/// The channel set connecting the dispatcher task to the rest of the
/// firmware. Built once and shared by reference; all channels use the
/// single-executor mutex, so every party must live on the same executor.
pub struct IsoChannels {
    /// Host requests into the dispatcher
    pub requests: Channel<NoopRawMutex, HostRequest, REQUEST_QUEUE_DEPTH>,
    /// Link events into the dispatcher
    pub events: Channel<NoopRawMutex, LinkEvent, EVENT_QUEUE_DEPTH>,
    /// Outbound control PDUs toward the transport
    pub tx: Channel<NoopRawMutex, PduOut, TX_QUEUE_DEPTH>,
    /// Notifications toward the host
    pub notifications: Channel<NoopRawMutex, HostEvent, NOTIF_QUEUE_DEPTH>,
}

impl IsoChannels {
    /// Create an empty channel set
    #[must_use]
    pub const fn new() -> Self {
        Self {
            requests: Channel::new(),
            events: Channel::new(),
            tx: Channel::new(),
            notifications: Channel::new(),
        }
    }
}

impl Default for IsoChannels {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive the dispatcher forever.
///
/// Each loop turn accepts one host request or one link event, runs the
/// dispatcher to quiescence and drains whatever it produced. Outbound
/// channels apply backpressure: a slow transport stalls the dispatcher
/// rather than losing PDUs.
pub async fn run<B: IsoBaseband>(
    mgr: &mut IsoManager,
    channels: &IsoChannels,
    bb: &mut B,
) -> ! {
    loop {
        match select(channels.requests.receive(), channels.events.receive()).await {
            Either::First(request) => {
                debug!("[cis] host request received");
                mgr.handle_request(request, bb);
            }
            Either::Second(event) => {
                mgr.post(event);
            }
        }
        mgr.process(bb);

        while let Some(pdu) = mgr.pop_tx() {
            channels.tx.send(pdu).await;
        }
        while let Some(event) = mgr.pop_notification() {
            channels.notifications.send(event).await;
        }
    }
}
