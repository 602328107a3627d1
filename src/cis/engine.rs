//! Initiator side of the CIS establishment handshake
//!
//! The central drives a three-PDU exchange per stream: CIS_REQ out,
//! CIS_RSP (or a reject) back, CIS_IND out. One attempt may be in
//! flight per ACL at a time, enforced by a gate on the connection
//! context. Every conclusion of an attempt, success or failure, is
//! raised as a canonical event back into the dispatcher rather than
//! handled inline.
//!
//! Placement of a new stream inside its group differs by position:
//! the group's first stream discovers a free slot through the
//! scheduler and fixes the group anchor, later streams derive their
//! offset from that anchor plus the airtime of the members already
//! placed.

use crate::baseband::IsoBaseband;
use crate::cis::machine::CisState;
use crate::cis::packet::{CisIndPdu, CisReqPdu, CisRspPdu, CtrlPdu, RejectExtIndPdu};
use crate::cis::registry::{CigContext, CisContext};
use crate::cis::timing;
use crate::cis::{Packing, TerminateReason};
use crate::constants::{opcode, reason};
use crate::manager::IsoManager;
use crate::{IsoError, LinkEvent};

impl IsoManager {
    /// Start establishing a stream on the given connection.
    ///
    /// On success a CIS_REQ is queued, the response timer armed and the
    /// per-ACL attempt gate taken. Resource failures after admission do
    /// not error here: they surface as an establishment-failed event
    /// through the dispatcher.
    ///
    /// # Errors
    /// `UnknownCis`/`UnknownCig`/`UnknownAcl` for unknown handles,
    /// `WrongState` when the stream is not idle or another attempt is
    /// already running on the connection.
    pub fn host_create_cis<B: IsoBaseband>(
        &mut self,
        cis_handle: u16,
        acl_handle: u16,
        bb: &mut B,
    ) -> Result<(), IsoError> {
        let cig_id = {
            let cis = self.registry.cis(cis_handle).ok_or(IsoError::UnknownCis)?;
            if cis.state != CisState::Idle || cis.req_pending {
                return Err(IsoError::WrongState);
            }
            cis.cig_id
        };
        let (first, cig_valid) = {
            let cig = self.registry.cig(cig_id).ok_or(IsoError::UnknownCig)?;
            (cig.num_cis_established == 0, cig.valid)
        };
        let acl = self
            .acl
            .link(acl_handle)
            .ok_or(IsoError::UnknownAcl)?
            .clone();
        if acl.cis_req_pending {
            return Err(IsoError::WrongState);
        }

        // bind early: failure events raised below are addressed to the
        // owning connection
        if let Some(cis) = self.registry.cis_mut(cis_handle) {
            cis.acl_handle = Some(acl_handle);
        }

        let plan = if first {
            if !cig_valid {
                warn!("[cis] cig {} invalid, failing stream {}", cig_id, cis_handle);
                self.local_resource_fail(cis_handle);
                return Ok(());
            }
            if self.registry.register_cig(cig_id, bb).is_err() {
                self.local_resource_fail(cis_handle);
                return Ok(());
            }
            let Some((cig, cis)) = self.plan_contexts(cig_id, cis_handle) else {
                return Err(IsoError::UnknownCis);
            };
            let plan = timing::first_cis_offset(
                &acl,
                &cig,
                &cis,
                &self.options,
                self.offset_override.as_ref(),
                bb,
            );
            if let Some(cig) = self.registry.cig_mut(cig_id) {
                cig.anchor_usec = plan.anchor_usec;
            }
            if self.registry.insert_member_head(cig_id, cis_handle).is_err() {
                self.local_resource_fail(cis_handle);
                return Ok(());
            }
            plan
        } else {
            let Some((cig, cis)) = self.plan_contexts(cig_id, cis_handle) else {
                return Err(IsoError::UnknownCis);
            };
            let prior = timing::packing_sum(&self.registry, &cig);
            let plan = timing::subsequent_cis_offset(&acl, &cig, &cis, prior, &self.options, bb);
            if self.registry.insert_member_tail(cig_id, cis_handle).is_err() {
                self.local_resource_fail(cis_handle);
                return Ok(());
            }
            plan
        };

        let access_addr = self.next_access_addr();
        let chan_id = timing::chan_identifier(access_addr);
        let widen = self.offset_override.as_ref().map_or(0, |o| o.widen_max_usec);
        let now = bb.now_usec();

        let req = {
            let Some(cis) = self.registry.cis_mut(cis_handle) else {
                return Err(IsoError::UnknownCis);
            };
            cis.offset_usec = plan.offset_usec;
            cis.ce_ref = plan.ce_ref;
            cis.cis_ce_ref = plan.cis_ce_ref;
            cis.cis_sync_delay_usec = plan.cis_sync_delay_usec;
            cis.access_addr = access_addr;
            cis.chan_id = chan_id;
            cis.crc_init = acl.crc_init;
            cis.sup_timeout_ms = acl.sup_timeout_ms;
            cis.chan_mask = acl.chan_mask;
            cis.req_pending = true;
            cis.llcp_armed_at_usec = Some(now);

            CisReqPdu {
                cig_id: cis.cig_id,
                cis_id: cis.cis_id,
                phy_m_to_s: cis.phy_m_to_s,
                phy_s_to_m: cis.phy_s_to_m,
                max_sdu_m_to_s: cis.max_sdu_m_to_s,
                max_sdu_s_to_m: cis.max_sdu_s_to_m,
                framed: cis.framed,
                sdu_interval_m_to_s: cis.sdu_interval_m_to_s,
                sdu_interval_s_to_m: cis.sdu_interval_s_to_m,
                max_tx_len: cis.max_tx_len,
                max_rx_len: cis.max_rx_len,
                nse: cis.nse,
                sub_interval_usec: cis.sub_interval_usec,
                bn_m_to_s: cis.bn_m_to_s,
                bn_s_to_m: cis.bn_s_to_m,
                ft_m_to_s: cis.ft_m_to_s,
                ft_s_to_m: cis.ft_s_to_m,
                iso_interval: cis.iso_interval,
                cis_offset_min_usec: plan.offset_usec,
                cis_offset_max_usec: plan.offset_usec + widen,
                ce_ref: plan.ce_ref,
            }
        };
        if let Some(link) = self.acl.link_mut(acl_handle) {
            link.cis_req_pending = true;
        }

        debug!(
            "[cis] requesting stream {} on acl {}, instant at event {}",
            cis_handle, acl_handle, plan.ce_ref
        );
        self.send_pdu(acl_handle, CtrlPdu::CisReq(req));
        Ok(())
    }

    // contexts are cloned so the planners borrow nothing from the
    // registry while it is being updated around them
    fn plan_contexts(&self, cig_id: u8, cis_handle: u16) -> Option<(CigContext, CisContext)> {
        let cig = self.registry.cig(cig_id)?;
        let cis = self.registry.cis(cis_handle)?;
        Some((cig.clone(), cis.clone()))
    }

    /// Peer accepted the request and offered its offset window.
    ///
    /// A window with `max < min` is a protocol violation: the peer gets
    /// a reject with a limited-resources reason and the attempt fails
    /// locally. A valid response builds the stream's share of the group
    /// operation, arms encryption, resolves the final offsets against
    /// the committed anchor and answers with CIS_IND.
    pub fn peer_cis_rsp<B: IsoBaseband>(&mut self, acl_handle: u16, rsp: &CisRspPdu, bb: &mut B) {
        let Some(cis_handle) = self.registry.find_pending_on_acl(acl_handle) else {
            warn!("[cis] CIS_RSP with no attempt pending on acl {}", acl_handle);
            return;
        };

        if rsp.cis_offset_max_usec < rsp.cis_offset_min_usec {
            warn!("[cis] peer offered an inverted offset window, rejecting");
            self.send_pdu(
                acl_handle,
                CtrlPdu::RejectExtInd(RejectExtIndPdu {
                    reject_opcode: opcode::CIS_REQ,
                    reason: reason::LIMITED_RESOURCES,
                }),
            );
            let cig_id = {
                let Some(cis) = self.registry.cis_mut(cis_handle) else {
                    return;
                };
                cis.llcp_armed_at_usec = None;
                cis.req_pending = false;
                cis.term_reason = Some(TerminateReason::LocalResources);
                cis.cig_id
            };
            self.registry.remove_member(cig_id, cis_handle);
            self.release_gate(Some(acl_handle));
            self.post(LinkEvent::EstFailed { cis_handle });
            return;
        }

        let Some(cig_id) = self.registry.cis(cis_handle).map(|c| c.cig_id) else {
            return;
        };
        let Some((op_built, op_running)) = self
            .registry
            .cig(cig_id)
            .map(|c| (c.op_built, c.op_running))
        else {
            warn!("[cis] response for stream {} without a group", cis_handle);
            return;
        };

        if op_built {
            bb.build_cis_op(cig_id, cis_handle);
        } else {
            bb.build_cig_op(cig_id, cis_handle);
            if let Some(cig) = self.registry.cig_mut(cig_id) {
                cig.op_built = true;
            }
        }
        bb.setup_encryption(cis_handle);

        if op_running {
            self.refresh_offsets(cig_id, cis_handle, acl_handle, bb);
        } else {
            let anchor = self.registry.cig(cig_id).map_or(0, |c| c.anchor_usec);
            bb.commit_cig_op(cig_id, anchor);
            if let Some(cig) = self.registry.cig_mut(cig_id) {
                cig.op_running = true;
            }
        }

        let cig_sync_delay_usec = self.registry.cig(cig_id).map_or(0, |c| c.sync_delay_usec);
        let ind = {
            let Some(cis) = self.registry.cis_mut(cis_handle) else {
                return;
            };
            cis.llcp_armed_at_usec = None;
            cis.req_pending = false;
            CisIndPdu {
                access_addr: cis.access_addr,
                cis_offset_usec: cis.offset_usec,
                cig_sync_delay_usec,
                cis_sync_delay_usec: cis.cis_sync_delay_usec,
                ce_ref: cis.ce_ref,
            }
        };
        self.send_pdu(acl_handle, CtrlPdu::CisInd(ind));
        self.release_gate(Some(acl_handle));
        self.post(LinkEvent::EstDone { cis_handle });
    }

    /// Recompute a late joiner's placement against a group operation
    /// that is already running. Connection events may have passed since
    /// the request went out; a fresh plan is adopted only when its
    /// instant is not earlier than the one already promised to the peer.
    fn refresh_offsets<B: IsoBaseband>(
        &mut self,
        cig_id: u8,
        cis_handle: u16,
        acl_handle: u16,
        bb: &B,
    ) {
        let Some(acl) = self.acl.link(acl_handle).cloned() else {
            return;
        };
        let Some((cig, cis)) = self.plan_contexts(cig_id, cis_handle) else {
            return;
        };
        let own = match cig.packing {
            Packing::Sequential => cis.airtime_usec(),
            Packing::Interleaved => cis.delay_usec,
        };
        let prior = timing::packing_sum(&self.registry, &cig).saturating_sub(own);
        let plan = timing::subsequent_cis_offset(&acl, &cig, &cis, prior, &self.options, bb);

        if let Some(cis) = self.registry.cis_mut(cis_handle) {
            if (plan.ce_ref.wrapping_sub(cis.ce_ref) as i16) >= 0 {
                cis.offset_usec = plan.offset_usec;
                cis.ce_ref = plan.ce_ref;
                cis.cis_ce_ref = plan.cis_ce_ref;
                cis.cis_sync_delay_usec = plan.cis_sync_delay_usec;
            }
        }
    }

    /// Peer refused the request outright
    pub fn peer_reject(&mut self, acl_handle: u16, reason_code: u8) {
        let Some(cis_handle) = self.registry.find_pending_on_acl(acl_handle) else {
            warn!("[cis] reject with no attempt pending on acl {}", acl_handle);
            return;
        };
        info!("[cis] peer rejected stream {}, reason {}", cis_handle, reason_code);
        if let Some(cis) = self.registry.cis_mut(cis_handle) {
            cis.llcp_armed_at_usec = None;
            cis.req_pending = false;
            cis.term_reason = Some(TerminateReason::PeerRejected(reason_code));
        }
        self.release_gate(Some(acl_handle));
        self.post(LinkEvent::EstFailed { cis_handle });
    }

    /// The response window elapsed without an answer from the peer
    pub fn llcp_timeout(&mut self, cis_handle: u16) {
        let Some((cig_id, acl_handle)) = self
            .registry
            .cis(cis_handle)
            .map(|c| (c.cig_id, c.acl_handle))
        else {
            trace!("[cis] timeout for unknown stream {}", cis_handle);
            return;
        };
        if let Some(cis) = self.registry.cis_mut(cis_handle) {
            cis.llcp_armed_at_usec = None;
            cis.req_pending = false;
            cis.term_reason = Some(TerminateReason::LlcpTimeout);
        }
        self.registry.remove_member(cig_id, cis_handle);
        self.release_gate(acl_handle);
        self.post(LinkEvent::EstFailed { cis_handle });
    }

    /// Local decision to refuse an attempt, an acceptor-side hook
    pub fn local_reject(&mut self, cis_handle: u16) {
        let acl_handle = self.registry.cis(cis_handle).and_then(|c| c.acl_handle);
        self.release_gate(acl_handle);
        self.post(LinkEvent::EstFailed { cis_handle });
    }

    /// Fail an attempt for local resource exhaustion. No PDU has been
    /// sent when this runs, so there is nothing to tell the peer.
    pub(crate) fn local_resource_fail(&mut self, cis_handle: u16) {
        let acl_handle = self.registry.cis(cis_handle).and_then(|c| c.acl_handle);
        if let Some(cis) = self.registry.cis_mut(cis_handle) {
            cis.llcp_armed_at_usec = None;
            cis.req_pending = false;
            cis.term_reason = Some(TerminateReason::LocalResources);
        }
        self.release_gate(acl_handle);
        self.post(LinkEvent::EstFailed { cis_handle });
    }
}
