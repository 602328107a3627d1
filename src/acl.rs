//! ACL connection coupling for isochronous streams
//!
//! The engine does not own ACL connections; it keeps the slice of ACL
//! state the establishment procedure consumes (event counter, interval,
//! timing of the next connection event) plus the hooks the owning
//! connection needs back: a termination predicate that accounts for live
//! streams, an instant-passed check, and the single-attempt gate released
//! when a create attempt concludes.

use crate::cis::machine::CisState;
use crate::cis::registry::IsoRegistry;
use crate::constants::MAX_ACL_LINKS;
use crate::IsoError;
use heapless::FnvIndexMap;

/// Per-connection state consumed by the CIS engine
#[derive(Debug, Clone)]
pub struct AclContext {
    /// Connection handle
    pub handle: u16,
    /// Connection event counter, advances once per connection event
    pub event_counter: u16,
    /// Connection interval in microseconds
    pub conn_interval_usec: u32,
    /// Peripheral latency in connection events
    pub max_latency: u16,
    /// CRC initializer, inherited by streams on this connection
    pub crc_init: u32,
    /// Supervision timeout in milliseconds, inherited by streams
    pub sup_timeout_ms: u16,
    /// Data channel map, inherited by streams
    pub chan_mask: u64,
    /// Absolute due time of the connection event `event_counter + 1`
    pub due_usec: u32,
    /// A CIS-creation LLCP exchange is in flight on this connection
    pub cis_req_pending: bool,
    /// At least one stream on this connection is established
    pub has_cis_established: bool,
}

impl AclContext {
    /// Create a context for a connection handle with neutral timing
    #[must_use]
    pub fn new(handle: u16) -> Self {
        Self {
            handle,
            event_counter: 0,
            conn_interval_usec: 0,
            max_latency: 0,
            crc_init: 0,
            sup_timeout_ms: 0,
            chan_mask: 0,
            due_usec: 0,
            cis_req_pending: false,
            has_cis_established: false,
        }
    }

    /// Whether the connection may finish terminating: every stream bound
    /// to it must be back in idle with no exchange outstanding
    #[must_use]
    pub fn ready_to_terminate(&self, reg: &IsoRegistry) -> bool {
        reg.children_of(self.handle).iter().all(|h| {
            reg.cis(*h)
                .is_none_or(|s| s.state == CisState::Idle && !s.req_pending)
        })
    }

    /// Whether a pending stream's establishment instant has been reached
    /// on this connection's timeline. Consulted once per connection event;
    /// the comparison is wrap-safe over the 16-bit counter.
    #[must_use]
    pub fn establishment_due(&self, reg: &IsoRegistry) -> bool {
        reg.children_of(self.handle).iter().any(|h| {
            reg.cis(*h).is_some_and(|s| {
                s.req_pending && (self.event_counter.wrapping_sub(s.ce_ref) as i16) >= 0
            })
        })
    }

    /// A create attempt on this connection concluded; release the
    /// single-attempt gate
    pub fn attempt_finished(&mut self) {
        self.cis_req_pending = false;
    }
}

/// Connection table keyed by handle
#[derive(Debug, Default)]
pub struct AclTable {
    links: FnvIndexMap<u16, AclContext, MAX_ACL_LINKS>,
}

impl AclTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            links: FnvIndexMap::new(),
        }
    }

    /// Track a connection
    ///
    /// # Errors
    /// `Capacity` when the table is full.
    pub fn add_link(&mut self, ctx: AclContext) -> Result<(), IsoError> {
        self.links
            .insert(ctx.handle, ctx)
            .map(|_| ())
            .map_err(|_| IsoError::Capacity)
    }

    /// Stop tracking a connection
    pub fn remove_link(&mut self, handle: u16) -> Option<AclContext> {
        self.links.remove(&handle)
    }

    /// Connection lookup
    #[must_use]
    pub fn link(&self, handle: u16) -> Option<&AclContext> {
        self.links.get(&handle)
    }

    /// Mutable connection lookup
    pub fn link_mut(&mut self, handle: u16) -> Option<&mut AclContext> {
        self.links.get_mut(&handle)
    }

    /// Number of tracked connections
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}
