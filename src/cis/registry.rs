//! CIG and CIS context storage, handle allocation and group membership
//!
//! CIS handles live in a numeric range disjoint from ACL handles, starting
//! at the configured maximum connection count. Group member lists are
//! ordered; insertion order drives the packing airtime sums in
//! [`crate::cis::timing`].

use crate::baseband::{IsoBaseband, SchedPreference};
use crate::cis::machine::CisState;
use crate::cis::timing;
use crate::cis::{CigParams, CisRole, Packing, TerminateReason};
use crate::constants::{ISO_INTERVAL_UNIT_USEC, MAX_CIG, MAX_CIS, MAX_CIS_PER_CIG};
use crate::{IsoError, IsoOptions};
use heapless::{FnvIndexMap, Vec};

/// Per-group context
#[derive(Debug, Clone)]
pub struct CigContext {
    /// Host-assigned group identifier
    pub cig_id: u8,
    /// Sub-event packing policy
    pub packing: Packing,
    /// ISO interval in microseconds
    pub iso_interval_usec: u32,
    /// Group synchronization delay in microseconds
    pub sync_delay_usec: u32,
    /// Committed absolute anchor time, meaningful once a first stream
    /// has planned its offset
    pub anchor_usec: u32,
    /// Parameters accepted and contexts allocated
    pub valid: bool,
    /// Registered with the baseband scheduler
    pub rm_added: bool,
    /// Group-level baseband descriptor has been built
    pub op_built: bool,
    /// Group-level operation committed to the scheduler
    pub op_running: bool,
    /// Streams currently established
    pub num_cis_established: u8,
    /// All stream handles allocated to this group
    pub cis_handles: Vec<u16, MAX_CIS_PER_CIG>,
    /// Ordered member list, insertion order drives packing sums
    pub members: Vec<u16, MAX_CIS_PER_CIG>,
}

/// Per-stream context
#[derive(Debug, Clone)]
pub struct CisContext {
    /// Allocated stream handle
    pub cis_handle: u16,
    /// Owning group
    pub cig_id: u8,
    /// Group-local stream identifier
    pub cis_id: u8,
    /// ACL the stream is bound to, set when establishment starts
    pub acl_handle: Option<u16>,
    /// Lifecycle state
    pub state: CisState,
    /// Local role on this stream
    pub role: CisRole,
    /// PHY bitmask, central to peripheral
    pub phy_m_to_s: u8,
    /// PHY bitmask, peripheral to central
    pub phy_s_to_m: u8,
    /// Maximum SDU size, central to peripheral
    pub max_sdu_m_to_s: u16,
    /// Maximum SDU size, peripheral to central
    pub max_sdu_s_to_m: u16,
    /// SDU interval in microseconds, central to peripheral
    pub sdu_interval_m_to_s: u32,
    /// SDU interval in microseconds, peripheral to central
    pub sdu_interval_s_to_m: u32,
    /// Framed SDUs
    pub framed: bool,
    /// Maximum transmit data-PDU payload length
    pub max_tx_len: u16,
    /// Maximum receive data-PDU payload length
    pub max_rx_len: u16,
    /// Number of sub-events
    pub nse: u8,
    /// Sub-event spacing in microseconds, configured guard included
    pub sub_interval_usec: u32,
    /// Burst number, central to peripheral
    pub bn_m_to_s: u8,
    /// Burst number, peripheral to central
    pub bn_s_to_m: u8,
    /// Flush timeout, central to peripheral
    pub ft_m_to_s: u8,
    /// Flush timeout, peripheral to central
    pub ft_s_to_m: u8,
    /// ISO interval in 1.25 ms units, as carried on the wire
    pub iso_interval: u16,
    /// This stream's slice of an interleaved group event in microseconds
    pub delay_usec: u32,
    /// Access address assigned at establishment
    pub access_addr: u32,
    /// Channel identifier derived from the access address
    pub chan_id: u16,
    /// Data channel map inherited from the owning ACL
    pub chan_mask: u64,
    /// CRC initializer inherited from the owning ACL
    pub crc_init: u32,
    /// Supervision timeout in milliseconds inherited from the owning ACL
    pub sup_timeout_ms: u16,
    /// Offset from the instant to the first sub-event in microseconds
    pub offset_usec: u32,
    /// ACL event counter at which the instant applies
    pub ce_ref: u16,
    /// Ordinal of the group anchor occurrence carrying the first transfer
    pub cis_ce_ref: u16,
    /// Stream synchronization delay in microseconds
    pub cis_sync_delay_usec: u32,
    /// CIS_REQ sent, response outstanding
    pub req_pending: bool,
    /// LLCP response timer start time, armed while `Some`
    pub llcp_armed_at_usec: Option<u32>,
    /// Reason captured for the most recent termination or failure
    pub term_reason: Option<TerminateReason>,
    /// Stream is established and carrying data
    pub enabled: bool,
}

impl CisContext {
    /// Airtime this stream occupies within one group event
    #[must_use]
    pub fn airtime_usec(&self) -> u32 {
        u32::from(self.nse) * self.sub_interval_usec
    }
}

/// Owner of all CIG and CIS contexts
#[derive(Debug)]
pub struct IsoRegistry {
    max_conn: u8,
    cigs: FnvIndexMap<u8, CigContext, MAX_CIG>,
    streams: FnvIndexMap<u16, CisContext, MAX_CIS>,
}

impl IsoRegistry {
    /// Create an empty registry sized by the configured connection count
    #[must_use]
    pub fn new(opts: &IsoOptions) -> Self {
        Self {
            max_conn: opts.max_conn,
            cigs: FnvIndexMap::new(),
            streams: FnvIndexMap::new(),
        }
    }

    /// Numeric-range test separating CIS handles from ACL handles
    #[must_use]
    pub fn is_cis_handle(&self, handle: u16) -> bool {
        handle >= u16::from(self.max_conn) && handle < u16::from(self.max_conn) + MAX_CIS as u16
    }

    /// Admit a group configuration, allocating one stream context and
    /// handle per configured CIS. Replaces an existing configuration for
    /// the same `cig_id` only while every old stream is idle and the group
    /// is not registered with the scheduler.
    ///
    /// # Errors
    /// `InvalidParams` on an unknown packing value or an empty group,
    /// `WrongState` when the old configuration is still in use,
    /// `Capacity` when context or handle space is exhausted.
    pub fn admit_cig(
        &mut self,
        params: &CigParams,
        opts: &IsoOptions,
    ) -> Result<Vec<u16, MAX_CIS_PER_CIG>, IsoError> {
        let packing = Packing::from_u8(params.packing).ok_or_else(|| {
            warn!("[cis] unknown packing policy {}", params.packing);
            IsoError::InvalidParams
        })?;
        if params.cis.is_empty() {
            return Err(IsoError::InvalidParams);
        }

        if let Some(old) = self.cigs.get(&params.cig_id) {
            let busy = old.rm_added
                || old.cis_handles.iter().any(|h| {
                    self.streams
                        .get(h)
                        .is_some_and(|s| s.state != CisState::Idle || s.req_pending)
                });
            if busy {
                return Err(IsoError::WrongState);
            }
            let old_handles = old.cis_handles.clone();
            for h in &old_handles {
                self.streams.remove(h);
            }
            self.cigs.remove(&params.cig_id);
        } else if self.cigs.len() == MAX_CIG {
            return Err(IsoError::Capacity);
        }

        let base = u16::from(self.max_conn);
        let mut handles: Vec<u16, MAX_CIS_PER_CIG> = Vec::new();
        for h in base..base + MAX_CIS as u16 {
            if handles.len() == params.cis.len() {
                break;
            }
            if !self.streams.contains_key(&h) {
                // cannot overflow, the loop range is no wider than the Vec
                let _ = handles.push(h);
            }
        }
        if handles.len() < params.cis.len() {
            return Err(IsoError::Capacity);
        }

        let iso_interval_usec = u32::from(params.iso_interval) * ISO_INTERVAL_UNIT_USEC;
        let mut sync_delay_usec: u32 = 0;
        for p in &params.cis {
            let slice = match packing {
                Packing::Sequential => {
                    u32::from(p.nse) * (p.sub_interval_usec + opts.sub_evt_space_usec)
                }
                Packing::Interleaved => timing::exchange_airtime_usec(
                    p.phy_m_to_s,
                    p.max_tx_len,
                    p.phy_s_to_m,
                    p.max_rx_len,
                ),
            };
            sync_delay_usec = sync_delay_usec.wrapping_add(slice);
        }

        // capacity checks above make the inserts below infallible
        for (p, handle) in params.cis.iter().zip(handles.iter()) {
            let ctx = CisContext {
                cis_handle: *handle,
                cig_id: params.cig_id,
                cis_id: p.cis_id,
                acl_handle: None,
                state: CisState::Idle,
                role: CisRole::Central,
                phy_m_to_s: p.phy_m_to_s,
                phy_s_to_m: p.phy_s_to_m,
                max_sdu_m_to_s: p.max_sdu_m_to_s,
                max_sdu_s_to_m: p.max_sdu_s_to_m,
                sdu_interval_m_to_s: p.sdu_interval_m_to_s,
                sdu_interval_s_to_m: p.sdu_interval_s_to_m,
                framed: p.framed,
                max_tx_len: p.max_tx_len,
                max_rx_len: p.max_rx_len,
                nse: p.nse,
                sub_interval_usec: p.sub_interval_usec + opts.sub_evt_space_usec,
                bn_m_to_s: p.bn_m_to_s,
                bn_s_to_m: p.bn_s_to_m,
                ft_m_to_s: p.ft_m_to_s,
                ft_s_to_m: p.ft_s_to_m,
                iso_interval: params.iso_interval,
                delay_usec: timing::exchange_airtime_usec(
                    p.phy_m_to_s,
                    p.max_tx_len,
                    p.phy_s_to_m,
                    p.max_rx_len,
                ),
                access_addr: 0,
                chan_id: 0,
                chan_mask: 0,
                crc_init: 0,
                sup_timeout_ms: 0,
                offset_usec: 0,
                ce_ref: 0,
                cis_ce_ref: 0,
                cis_sync_delay_usec: 0,
                req_pending: false,
                llcp_armed_at_usec: None,
                term_reason: None,
                enabled: false,
            };
            if self.streams.insert(*handle, ctx).is_err() {
                return Err(IsoError::Capacity);
            }
        }

        let cig = CigContext {
            cig_id: params.cig_id,
            packing,
            iso_interval_usec,
            sync_delay_usec,
            anchor_usec: 0,
            valid: true,
            rm_added: false,
            op_built: false,
            op_running: false,
            num_cis_established: 0,
            cis_handles: handles.clone(),
            members: Vec::new(),
        };
        if self.cigs.insert(params.cig_id, cig).is_err() {
            for h in &handles {
                self.streams.remove(h);
            }
            return Err(IsoError::Capacity);
        }

        debug!("[cis] cig {} admitted, {} stream(s)", params.cig_id, handles.len());
        Ok(handles)
    }

    /// Drop a group and every stream context allocated to it
    ///
    /// # Errors
    /// `UnknownCig` when no such group exists.
    pub fn remove_cig(&mut self, cig_id: u8) -> Result<(), IsoError> {
        let cig = self.cigs.remove(&cig_id).ok_or(IsoError::UnknownCig)?;
        for h in &cig.cis_handles {
            self.streams.remove(h);
        }
        debug!("[cis] cig {} removed", cig_id);
        Ok(())
    }

    /// Group lookup
    #[must_use]
    pub fn cig(&self, cig_id: u8) -> Option<&CigContext> {
        self.cigs.get(&cig_id)
    }

    /// Mutable group lookup
    pub fn cig_mut(&mut self, cig_id: u8) -> Option<&mut CigContext> {
        self.cigs.get_mut(&cig_id)
    }

    /// Stream lookup by handle
    #[must_use]
    pub fn cis(&self, handle: u16) -> Option<&CisContext> {
        self.streams.get(&handle)
    }

    /// Mutable stream lookup by handle
    pub fn cis_mut(&mut self, handle: u16) -> Option<&mut CisContext> {
        self.streams.get_mut(&handle)
    }

    /// Insert a stream at the head of its group's member list, used for
    /// the member that defines the group anchor
    ///
    /// # Errors
    /// `UnknownCig` when no such group exists, `Capacity` when the member
    /// list is full.
    pub fn insert_member_head(&mut self, cig_id: u8, handle: u16) -> Result<(), IsoError> {
        let cig = self.cigs.get_mut(&cig_id).ok_or(IsoError::UnknownCig)?;
        cig.members
            .insert(0, handle)
            .map_err(|_| IsoError::Capacity)
    }

    /// Append a stream to its group's member list
    ///
    /// # Errors
    /// `UnknownCig` when no such group exists, `Capacity` when the member
    /// list is full.
    pub fn insert_member_tail(&mut self, cig_id: u8, handle: u16) -> Result<(), IsoError> {
        let cig = self.cigs.get_mut(&cig_id).ok_or(IsoError::UnknownCig)?;
        cig.members.push(handle).map_err(|_| IsoError::Capacity)
    }

    /// Remove a stream from its group's member list, preserving the order
    /// of the remaining members. Removing an absent member is a no-op.
    pub fn remove_member(&mut self, cig_id: u8, handle: u16) {
        if let Some(cig) = self.cigs.get_mut(&cig_id) {
            if let Some(pos) = cig.members.iter().position(|h| *h == handle) {
                cig.members.remove(pos);
            }
        }
    }

    /// Release a stream context and its handle. The group's member list is
    /// left untouched; callers that inserted the stream must remove it
    /// themselves.
    pub fn free_cis(&mut self, handle: u16) {
        if let Some(ctx) = self.streams.remove(&handle) {
            if let Some(cig) = self.cigs.get_mut(&ctx.cig_id) {
                if let Some(pos) = cig.cis_handles.iter().position(|h| *h == handle) {
                    cig.cis_handles.remove(pos);
                }
            }
            trace!("[cis] stream {} freed", handle);
        }
    }

    /// Handle of the stream with a CIS_REQ outstanding on the given ACL,
    /// if any. At most one exchange may be in flight per ACL.
    #[must_use]
    pub fn find_pending_on_acl(&self, acl_handle: u16) -> Option<u16> {
        self.streams
            .iter()
            .find(|(_, s)| s.req_pending && s.acl_handle == Some(acl_handle))
            .map(|(h, _)| *h)
    }

    /// Handle of the stream carrying the given group and stream
    /// identifiers, the addressing used by LL_CIS_TERMINATE_IND
    #[must_use]
    pub fn find_by_ids(&self, cig_id: u8, cis_id: u8) -> Option<u16> {
        self.streams
            .iter()
            .find(|(_, s)| s.cig_id == cig_id && s.cis_id == cis_id)
            .map(|(h, _)| *h)
    }

    /// Whether any stream already carries the given access address
    #[must_use]
    pub fn aa_in_use(&self, access_addr: u32) -> bool {
        self.streams.values().any(|s| s.access_addr == access_addr)
    }

    /// Handles of every stream bound to the given ACL
    #[must_use]
    pub fn children_of(&self, acl_handle: u16) -> Vec<u16, MAX_CIS> {
        let mut out = Vec::new();
        for (h, s) in &self.streams {
            if s.acl_handle == Some(acl_handle) {
                // out is sized to hold every stream
                let _ = out.push(*h);
            }
        }
        out
    }

    /// Streams with an armed LLCP response timer, paired with the arm time
    #[must_use]
    pub fn armed_streams(&self) -> Vec<(u16, u32), MAX_CIS> {
        let mut out = Vec::new();
        for (h, s) in &self.streams {
            if let Some(armed) = s.llcp_armed_at_usec {
                // out is sized to hold every stream
                let _ = out.push((*h, armed));
            }
        }
        out
    }

    /// Register the group's periodic activity with the baseband scheduler.
    /// Idempotent: a group already registered performs no external call.
    ///
    /// # Errors
    /// `UnknownCig` when no such group exists, `Capacity` when the
    /// scheduler refuses the activity. The registered flag is untouched on
    /// failure.
    pub fn register_cig<B: IsoBaseband>(
        &mut self,
        cig_id: u8,
        bb: &mut B,
    ) -> Result<(), IsoError> {
        let cig = self.cigs.get_mut(&cig_id).ok_or(IsoError::UnknownCig)?;
        if cig.rm_added {
            return Ok(());
        }
        let ok = bb.register_cig(
            cig_id,
            SchedPreference::Performance,
            cig.iso_interval_usec,
            cig.iso_interval_usec,
            cig.sync_delay_usec,
        );
        if !ok {
            warn!("[cis] scheduler refused cig {}", cig_id);
            return Err(IsoError::Capacity);
        }
        cig.rm_added = true;
        Ok(())
    }
}
