//! Isochronous stream manager, the single dispatcher for all CIS activity
//!
//! One logical thread owns every context and runs every state transition
//! to completion. Nothing here blocks: waiting for a peer PDU, a timer or
//! a scheduler slot is represented as a future event re-entering the same
//! dispatcher.
//!
//! ## Event flow
//!
//! 1. Host requests arrive through [`IsoManager::handle_request`]
//! 2. Link events (received control PDUs, connection events, failures)
//!    arrive through [`IsoManager::dispatch`]
//! 3. Operations that conclude an establishment attempt post canonical
//!    events back onto an internal queue, drained by
//!    [`IsoManager::process`] until empty
//! 4. Outbound control PDUs and host notifications are queued and pulled
//!    by the surrounding processor loop
//!
//! Internal posting is best effort: when the event queue is full the
//! event is dropped with a warning rather than blocking the dispatcher.
//!
//! ## State machine execution
//!
//! Every raw event addressed to a stream goes through remap first, then
//! the pure transition table in [`crate::cis::machine`]. The manager only
//! performs the returned action; the table itself stays data.

use heapless::Deque;

use crate::acl::{AclContext, AclTable};
use crate::baseband::IsoBaseband;
use crate::cis::machine::{self, CisAction, CisState};
use crate::cis::packet::{CisTerminateIndPdu, CtrlPdu};
use crate::cis::registry::IsoRegistry;
use crate::cis::{CisRole, TerminateReason};
use crate::constants::{
    ADV_ACCESS_ADDR, EVENT_QUEUE_DEPTH, NOTIF_QUEUE_DEPTH, TX_QUEUE_DEPTH, opcode, reason,
};
use crate::{HostEvent, HostRequest, IsoError, IsoOptions, LinkEvent, OffsetOverride};

/// An outbound control PDU tagged with the ACL that carries it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduOut {
    /// Connection the PDU is sent on
    pub acl_handle: u16,
    /// The control PDU
    pub pdu: CtrlPdu,
}

/// Owner of all CIS state and the single dispatcher for its events
pub struct IsoManager {
    pub(crate) options: IsoOptions,
    pub(crate) role: CisRole,
    pub(crate) registry: IsoRegistry,
    pub(crate) acl: AclTable,
    pub(crate) pending: Deque<LinkEvent, EVENT_QUEUE_DEPTH>,
    pub(crate) tx: Deque<PduOut, TX_QUEUE_DEPTH>,
    pub(crate) notifications: Deque<HostEvent, NOTIF_QUEUE_DEPTH>,
    pub(crate) aa_state: u32,
    pub(crate) offset_override: Option<OffsetOverride>,
}

impl IsoManager {
    /// Create a manager for the given role
    #[must_use]
    pub fn new(options: IsoOptions, role: CisRole) -> Self {
        let aa_state = if options.aa_seed == 0 {
            crate::constants::DEFAULT_AA_SEED
        } else {
            options.aa_seed
        };
        Self {
            registry: IsoRegistry::new(&options),
            options,
            role,
            acl: AclTable::new(),
            pending: Deque::new(),
            tx: Deque::new(),
            notifications: Deque::new(),
            aa_state,
            offset_override: None,
        }
    }

    /// The configuration supplied at construction
    #[must_use]
    pub fn options(&self) -> &IsoOptions {
        &self.options
    }

    /// The role selected at construction
    #[must_use]
    pub fn role(&self) -> CisRole {
        self.role
    }

    /// Context storage, read access
    #[must_use]
    pub fn registry(&self) -> &IsoRegistry {
        &self.registry
    }

    /// Context storage, write access for integration hooks
    pub fn registry_mut(&mut self) -> &mut IsoRegistry {
        &mut self.registry
    }

    /// Tracked connections, read access
    #[must_use]
    pub fn acl_links(&self) -> &AclTable {
        &self.acl
    }

    /// Tracked connections, write access for integration hooks
    pub fn acl_links_mut(&mut self) -> &mut AclTable {
        &mut self.acl
    }

    /// Track a connection the engine may establish streams on
    ///
    /// # Errors
    /// `Capacity` when the connection table is full.
    pub fn add_acl(&mut self, ctx: AclContext) -> Result<(), IsoError> {
        self.acl.add_link(ctx)
    }

    /// Stop tracking a connection
    pub fn remove_acl(&mut self, handle: u16) -> Option<AclContext> {
        self.acl.remove_link(handle)
    }

    /// Force the offset and reference of the next establishment attempt,
    /// a tooling path that bypasses slot discovery
    pub fn set_offset_override(&mut self, over: Option<OffsetOverride>) {
        self.offset_override = over;
    }

    /// Queue an event for the dispatcher. Best effort: a full queue drops
    /// the event with a warning.
    pub fn post(&mut self, event: LinkEvent) {
        if self.pending.push_back(event).is_err() {
            warn!("[cis] event queue full, dropping event");
        }
    }

    /// Drain the internal event queue, dispatching each event in arrival
    /// order. Dispatching may post further events; the loop runs until
    /// the queue is empty.
    pub fn process<B: IsoBaseband>(&mut self, bb: &mut B) {
        while let Some(event) = self.pending.pop_front() {
            self.dispatch(&event, bb);
        }
    }

    /// Pull the next outbound control PDU
    pub fn pop_tx(&mut self) -> Option<PduOut> {
        self.tx.pop_front()
    }

    /// Pull the next host notification
    pub fn pop_notification(&mut self) -> Option<HostEvent> {
        self.notifications.pop_front()
    }

    /// Apply a host request
    pub fn handle_request<B: IsoBaseband>(&mut self, request: HostRequest, bb: &mut B) {
        match request {
            HostRequest::SetCigParams(params) => {
                if self.role != CisRole::Central {
                    self.notify(HostEvent::Error(IsoError::WrongRole));
                    return;
                }
                let cig_id = params.cig_id;
                match self.registry.admit_cig(&params, &self.options) {
                    Ok(cis_handles) => self.notify(HostEvent::CigConfigured {
                        cig_id,
                        cis_handles,
                    }),
                    Err(e) => self.notify(HostEvent::Error(e)),
                }
            }
            HostRequest::RemoveCig { cig_id } => self.remove_cig(cig_id, bb),
            HostRequest::CreateCis {
                cis_handle,
                acl_handle,
            } => {
                if self.role != CisRole::Central {
                    self.notify(HostEvent::Error(IsoError::WrongRole));
                    return;
                }
                if let Err(e) = self.host_create_cis(cis_handle, acl_handle, bb) {
                    self.notify(HostEvent::Error(e));
                }
            }
            HostRequest::Disconnect { cis_handle, reason } => {
                self.post(LinkEvent::HostDisconnect { cis_handle, reason });
            }
        }
    }

    /// Dispatch one raw link event
    pub fn dispatch<B: IsoBaseband>(&mut self, event: &LinkEvent, bb: &mut B) {
        match event {
            LinkEvent::LlcpRx { acl_handle, data } => self.llcp_rx(*acl_handle, data, bb),
            LinkEvent::ConnEvent {
                acl_handle,
                event_counter,
                due_usec,
                now_usec,
            } => self.conn_event(*acl_handle, *event_counter, *due_usec, *now_usec),
            LinkEvent::SupervisionTimeout { acl_handle } => {
                for handle in self.registry.children_of(*acl_handle) {
                    self.sm_step(handle, event, bb);
                }
            }
            LinkEvent::MicFailure { cis_handle }
            | LinkEvent::HostDisconnect { cis_handle, .. }
            | LinkEvent::EstDone { cis_handle }
            | LinkEvent::EstFailed { cis_handle }
            | LinkEvent::Closed { cis_handle } => self.sm_step(*cis_handle, event, bb),
            LinkEvent::LlcpTimeout { cis_handle } => self.llcp_timeout(*cis_handle),
            LinkEvent::LocalTerm { cis_handle } => self.local_resource_fail(*cis_handle),
        }
    }

    fn llcp_rx<B: IsoBaseband>(&mut self, acl_handle: u16, data: &[u8], bb: &mut B) {
        match CtrlPdu::from_bytes(data) {
            Ok(CtrlPdu::CisRsp(rsp)) => {
                if self.role == CisRole::Central {
                    self.peer_cis_rsp(acl_handle, &rsp, bb);
                } else {
                    warn!("[cis] CIS_RSP received in peripheral role, dropping");
                }
            }
            Ok(CtrlPdu::RejectExtInd(rej)) => {
                if rej.reject_opcode == opcode::CIS_REQ {
                    self.peer_reject(acl_handle, rej.reason);
                } else {
                    trace!("[cis] reject for opcode {}, not ours", rej.reject_opcode);
                }
            }
            Ok(CtrlPdu::CisTerminateInd(term)) => self.peer_terminate(&term),
            Ok(CtrlPdu::CisReq(_)) => {
                warn!("[cis] CIS_REQ received, acceptor role not handled here");
            }
            Ok(CtrlPdu::CisInd(_)) => {
                trace!("[cis] unexpected CIS_IND on acl {}", acl_handle);
            }
            Err(e) => {
                warn!("[cis] undecodable control PDU on acl {}: {}", acl_handle, e);
            }
        }
    }

    /// A connection event on an ACL advanced its timeline: refresh the
    /// cached counter and due time, surface any reached instant, and
    /// run the LLCP response timer scan.
    fn conn_event(&mut self, acl_handle: u16, event_counter: u16, due_usec: u32, now_usec: u32) {
        let Some(acl) = self.acl.link_mut(acl_handle) else {
            trace!("[cis] conn event for unknown acl {}", acl_handle);
            return;
        };
        acl.event_counter = event_counter;
        acl.due_usec = due_usec;

        let acl_snapshot = acl.clone();
        if acl_snapshot.establishment_due(&self.registry) {
            trace!("[cis] establishment instant reached on acl {}", acl_handle);
        }

        self.tick(now_usec);
    }

    /// Scan the LLCP response timers of every pending attempt and post a
    /// timeout event for each expired one. Connection events on any live
    /// ACL drive the scan; firmware can also call it directly to reap a
    /// stranded attempt when no link is up.
    pub fn tick(&mut self, now_usec: u32) {
        let timeout = self.options.llcp_timeout_usec;
        for (handle, armed) in self.registry.armed_streams() {
            if now_usec.wrapping_sub(armed) >= timeout {
                if let Some(cis) = self.registry.cis_mut(handle) {
                    cis.llcp_armed_at_usec = None;
                }
                warn!("[cis] llcp response timer fired for stream {}", handle);
                self.post(LinkEvent::LlcpTimeout { cis_handle: handle });
            }
        }
    }

    fn peer_terminate(&mut self, term: &CisTerminateIndPdu) {
        let Some(handle) = self.registry.find_by_ids(term.cig_id, term.cis_id) else {
            warn!(
                "[cis] terminate for unknown stream cig={} cis={}",
                term.cig_id, term.cis_id
            );
            return;
        };
        if let Some(cis) = self.registry.cis_mut(handle) {
            cis.term_reason = Some(TerminateReason::PeerTerminated(term.reason));
        }
        self.post(LinkEvent::Closed { cis_handle: handle });
    }

    /// Run one raw event through remap and the transition table, then
    /// perform the resulting action. Events with no canonical form return
    /// without touching or logging state; canonical events outside the
    /// table are a traced no-op.
    pub(crate) fn sm_step<B: IsoBaseband>(
        &mut self,
        cis_handle: u16,
        event: &LinkEvent,
        bb: &mut B,
    ) {
        let (state, canonical) = {
            let Some(cis) = self.registry.cis_mut(cis_handle) else {
                trace!("[cis] event for unknown stream {}", cis_handle);
                return;
            };
            let Some(canonical) = machine::remap(cis, event) else {
                return;
            };
            (cis.state, canonical)
        };

        let (next, action) = machine::transition(state, canonical);
        let Some(action) = action else {
            trace!("[cis] stream {} ignored event in current state", cis_handle);
            return;
        };

        if let Some(cis) = self.registry.cis_mut(cis_handle) {
            cis.state = next;
        }
        debug!("[cis] stream {} state advanced", cis_handle);
        self.perform(cis_handle, action, bb);
    }

    fn perform<B: IsoBaseband>(&mut self, cis_handle: u16, action: CisAction, bb: &mut B) {
        match action {
            CisAction::Establish => self.establish(cis_handle),
            CisAction::EstablishFail => self.establish_fail(cis_handle),
            CisAction::BeginTerm => self.begin_term(cis_handle),
            CisAction::AbruptEnd | CisAction::Cleanup => self.teardown_cis(cis_handle, bb),
        }
    }

    /// Mark the stream live, propagate to its group and connection, and
    /// notify the host with the negotiated parameters
    fn establish(&mut self, cis_handle: u16) {
        let Some(cis) = self.registry.cis_mut(cis_handle) else {
            return;
        };
        cis.enabled = true;
        let cig_id = cis.cig_id;
        let acl_handle = cis.acl_handle;
        let cis_sync_delay_usec = cis.cis_sync_delay_usec;
        let nse = cis.nse;
        let ft_m_to_s = cis.ft_m_to_s;
        let ft_s_to_m = cis.ft_s_to_m;
        let bn_m_to_s = cis.bn_m_to_s;
        let bn_s_to_m = cis.bn_s_to_m;
        let access_addr = cis.access_addr;

        let (cig_sync_delay_usec, iso_interval_usec) = match self.registry.cig_mut(cig_id) {
            Some(cig) => {
                cig.num_cis_established += 1;
                (cig.sync_delay_usec, cig.iso_interval_usec)
            }
            None => (0, 0),
        };
        if let Some(h) = acl_handle {
            if let Some(acl) = self.acl.link_mut(h) {
                acl.has_cis_established = true;
            }
        }
        info!("[cis] stream {} established", cis_handle);
        self.notify(HostEvent::CisEstablished {
            cis_handle,
            cig_sync_delay_usec,
            cis_sync_delay_usec,
            iso_interval_usec,
            nse,
            ft_m_to_s,
            ft_s_to_m,
            bn_m_to_s,
            bn_s_to_m,
            access_addr,
        });
    }

    /// Release the attempt's resources and tell the host why it failed
    fn establish_fail(&mut self, cis_handle: u16) {
        let code = self
            .registry
            .cis(cis_handle)
            .and_then(|c| c.term_reason)
            .map_or(reason::CONN_FAILED_TO_ESTABLISH, |r| r.code());
        info!("[cis] stream {} establishment failed, reason {}", cis_handle, code);
        self.notify(HostEvent::CisEstablishFailed {
            cis_handle,
            reason: code,
        });
        self.registry.free_cis(cis_handle);
    }

    /// Tell the peer the stream is going down
    fn begin_term(&mut self, cis_handle: u16) {
        let Some(cis) = self.registry.cis(cis_handle) else {
            return;
        };
        let Some(acl_handle) = cis.acl_handle else {
            warn!("[cis] stream {} has no owning acl, cannot terminate", cis_handle);
            return;
        };
        let pdu = CisTerminateIndPdu {
            cig_id: cis.cig_id,
            cis_id: cis.cis_id,
            reason: cis
                .term_reason
                .map_or(reason::REMOTE_USER_TERM, |r| r.code()),
        };
        self.send_pdu(acl_handle, CtrlPdu::CisTerminateInd(pdu));
    }

    /// Release everything the stream holds: timer, pending flag, group
    /// membership, established count and finally the context itself. The
    /// group's scheduler registration is dropped when its last member is
    /// gone.
    fn teardown_cis<B: IsoBaseband>(&mut self, cis_handle: u16, bb: &mut B) {
        let Some(cis) = self.registry.cis_mut(cis_handle) else {
            return;
        };
        let cig_id = cis.cig_id;
        let acl_handle = cis.acl_handle;
        let was_enabled = cis.enabled;
        let code = cis
            .term_reason
            .map_or(reason::REMOTE_USER_TERM, |r| r.code());
        cis.llcp_armed_at_usec = None;
        cis.req_pending = false;
        cis.enabled = false;

        if was_enabled {
            if let Some(cig) = self.registry.cig_mut(cig_id) {
                cig.num_cis_established = cig.num_cis_established.saturating_sub(1);
            }
        }
        self.registry.remove_member(cig_id, cis_handle);
        self.registry.free_cis(cis_handle);

        if let Some(h) = acl_handle {
            let still_established = self
                .registry
                .children_of(h)
                .iter()
                .any(|c| self.registry.cis(*c).is_some_and(|s| s.enabled));
            if let Some(acl) = self.acl.link_mut(h) {
                acl.has_cis_established = still_established;
            }
        }

        let destroy = self
            .registry
            .cig(cig_id)
            .is_some_and(|c| c.members.is_empty() && c.num_cis_established == 0);
        if destroy {
            if let Some(cig) = self.registry.cig_mut(cig_id) {
                if cig.rm_added {
                    bb.unregister_cig(cig_id);
                    cig.rm_added = false;
                }
            }
            if self.registry.remove_cig(cig_id).is_ok() {
                debug!("[cis] cig {} destroyed after last stream", cig_id);
            }
        }

        info!("[cis] stream {} closed, reason {}", cis_handle, code);
        self.notify(HostEvent::CisDisconnected {
            cis_handle,
            reason: code,
        });
    }

    fn remove_cig<B: IsoBaseband>(&mut self, cig_id: u8, bb: &mut B) {
        let Some(cig) = self.registry.cig(cig_id) else {
            self.notify(HostEvent::Error(IsoError::UnknownCig));
            return;
        };
        let busy = cig.cis_handles.iter().any(|h| {
            self.registry
                .cis(*h)
                .is_some_and(|s| s.state != CisState::Idle || s.req_pending)
        });
        if busy {
            self.notify(HostEvent::Error(IsoError::WrongState));
            return;
        }
        if cig.rm_added {
            bb.unregister_cig(cig_id);
        }
        match self.registry.remove_cig(cig_id) {
            Ok(()) => self.notify(HostEvent::CigRemoved { cig_id }),
            Err(e) => self.notify(HostEvent::Error(e)),
        }
    }

    pub(crate) fn notify(&mut self, event: HostEvent) {
        if self.notifications.push_back(event).is_err() {
            warn!("[cis] notification queue full, dropping");
        }
    }

    pub(crate) fn send_pdu(&mut self, acl_handle: u16, pdu: CtrlPdu) {
        if self.tx.push_back(PduOut { acl_handle, pdu }).is_err() {
            warn!("[cis] tx queue full, dropping pdu for acl {}", acl_handle);
        }
    }

    pub(crate) fn release_gate(&mut self, acl_handle: Option<u16>) {
        if let Some(h) = acl_handle {
            if let Some(acl) = self.acl.link_mut(h) {
                acl.attempt_finished();
            }
        }
    }

    /// Next access address from the generator state: never zero, never
    /// the advertising access address, never one already assigned
    pub(crate) fn next_access_addr(&mut self) -> u32 {
        loop {
            let mut x = self.aa_state;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.aa_state = x;
            if x == 0 || x == ADV_ACCESS_ADDR || self.registry.aa_in_use(x) {
                continue;
            }
            return x;
        }
    }
}
