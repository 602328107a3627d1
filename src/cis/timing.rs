//! CIS anchor and offset arithmetic
//!
//! Produces the `(ceRef, cisCeRef, offsetUsec, cisSyncDelayUsec)` tuple for
//! a newly admitted stream. All absolute times are microseconds on the
//! wrapping 32-bit baseband clock; event counters wrap at 16 bits.

use crate::acl::AclContext;
use crate::baseband::IsoBaseband;
use crate::cis::Packing;
use crate::cis::registry::{CigContext, CisContext, IsoRegistry};
use crate::constants::T_IFS_USEC;
use crate::{IsoOptions, OffsetOverride};

/// Resolved timing for one CIS establishment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OffsetPlan {
    /// ACL event counter at which the instant applies
    pub ce_ref: u16,
    /// Ordinal of the CIG anchor occurrence carrying this stream's first
    /// transfer, zero for the stream that defines the anchor
    pub cis_ce_ref: u16,
    /// Offset from the instant to the stream's first sub-event in
    /// microseconds
    pub offset_usec: u32,
    /// This stream's synchronization delay within the group in microseconds
    pub cis_sync_delay_usec: u32,
    /// Absolute CIG anchor time implied by this plan
    pub anchor_usec: u32,
}

/// Upper bound the final offset must stay below so the CIS event fits
/// ahead of the next connection event
#[must_use]
pub fn offset_limit_usec(
    conn_interval_usec: u32,
    nse: u8,
    sub_interval_usec: u32,
    guard_usec: u32,
) -> u32 {
    let reserved = u32::from(nse.saturating_sub(1))
        .wrapping_mul(sub_interval_usec)
        .wrapping_add(guard_usec);
    conn_interval_usec.wrapping_sub(reserved)
}

/// Fold whole connection intervals out of the offset into the reference
/// event counter until the offset satisfies the limit. The implied anchor
/// time is unchanged: each iteration moves exactly one ACL interval from
/// the offset into `ce_ref`.
fn normalize(offset_usec: &mut u32, ce_ref: &mut u16, conn_interval_usec: u32, limit_usec: u32) {
    while *offset_usec >= limit_usec {
        *offset_usec = offset_usec.wrapping_sub(conn_interval_usec);
        *ce_ref = ce_ref.wrapping_add(1);
    }
}

/// Reference instant for a new attempt: the first ACL event far enough out
/// that the peer is guaranteed to be listening even at full slave latency.
/// Returns the event counter and its absolute due time.
fn base_instant(acl: &AclContext, min_instant: u8) -> (u16, u32) {
    let ahead = u16::from(min_instant)
        .wrapping_add(1)
        .wrapping_add(acl.max_latency);
    let ce_ref = acl.event_counter.wrapping_add(ahead);
    // due_usec is the event at event_counter + 1
    let events_past_due = u32::from(ahead) - 1;
    let ref_usec = acl
        .due_usec
        .wrapping_add(events_past_due.wrapping_mul(acl.conn_interval_usec));
    (ce_ref, ref_usec)
}

/// Compute the offset tuple for the first stream of a group. The group
/// anchor does not exist yet, so the baseband picks the earliest free slot
/// within the ISO interval and the anchor is derived from it.
pub fn first_cis_offset<B: IsoBaseband>(
    acl: &AclContext,
    cig: &CigContext,
    cis: &CisContext,
    opts: &IsoOptions,
    over: Option<&OffsetOverride>,
    bb: &mut B,
) -> OffsetPlan {
    let (mut ce_ref, ref_usec) = base_instant(acl, opts.min_instant);
    let mut offset_usec = bb.min_free_offset(cig.iso_interval_usec, cig.cig_id, ref_usec);

    if let Some(over) = over {
        offset_usec = over.offset_usec;
        if let Some(forced) = over.ce_ref {
            ce_ref = forced;
        }
    }

    // anchor before normalization; the loop below preserves it
    let anchor_usec = ref_usec.wrapping_add(offset_usec);
    let limit = offset_limit_usec(
        acl.conn_interval_usec,
        cis.nse,
        cis.sub_interval_usec,
        opts.sched_guard_usec,
    );
    normalize(&mut offset_usec, &mut ce_ref, acl.conn_interval_usec, limit);

    trace!(
        "[cis] first offset cig={} offset={} ce_ref={} anchor={}",
        cig.cig_id, offset_usec, ce_ref, anchor_usec
    );

    OffsetPlan {
        ce_ref,
        cis_ce_ref: 0,
        offset_usec,
        cis_sync_delay_usec: cig.sync_delay_usec,
        anchor_usec,
    }
}

/// Compute the offset tuple for a stream joining a group whose anchor is
/// already committed. Walks forward from the committed anchor to the first
/// ISO occurrence strictly after the ACL reference, then applies the
/// packing adjustment for the members already in the group.
pub fn subsequent_cis_offset<B: IsoBaseband>(
    acl: &AclContext,
    cig: &CigContext,
    cis: &CisContext,
    prior_sum_usec: u32,
    opts: &IsoOptions,
    bb: &B,
) -> OffsetPlan {
    let (mut ce_ref, ref_usec) = base_instant(acl, opts.min_instant);

    // first CIG anchor occurrence strictly after the reference; terminates
    // because the ISO interval is nonzero and the clock is finite
    let mut cis_ce_ref: u16 = 1;
    let mut occurrence = cig
        .anchor_usec
        .wrapping_add(cig.iso_interval_usec);
    while bb.time_delta(occurrence, ref_usec) <= 0 {
        occurrence = occurrence.wrapping_add(cig.iso_interval_usec);
        cis_ce_ref = cis_ce_ref.wrapping_add(1);
    }

    let mut offset_usec = occurrence.wrapping_sub(ref_usec);
    let limit = offset_limit_usec(
        acl.conn_interval_usec,
        cis.nse,
        cis.sub_interval_usec,
        opts.sched_guard_usec,
    );
    normalize(&mut offset_usec, &mut ce_ref, acl.conn_interval_usec, limit);

    // packing adjustment lands the newcomer after the existing members
    offset_usec = offset_usec.wrapping_add(prior_sum_usec);
    let cis_sync_delay_usec = cig.sync_delay_usec.wrapping_sub(prior_sum_usec);

    trace!(
        "[cis] subsequent offset cig={} offset={} ce_ref={} cis_ce_ref={}",
        cig.cig_id, offset_usec, ce_ref, cis_ce_ref
    );

    OffsetPlan {
        ce_ref,
        cis_ce_ref,
        offset_usec,
        cis_sync_delay_usec,
        anchor_usec: cig.anchor_usec,
    }
}

/// Intra-event displacement accumulated by the members already in the
/// group, in insertion order. Sequential packing stacks whole stream
/// airtimes; interleaved packing stacks per-member sub-event delays.
#[must_use]
pub fn packing_sum(reg: &IsoRegistry, cig: &CigContext) -> u32 {
    let mut sum: u32 = 0;
    for handle in &cig.members {
        let Some(member) = reg.cis(*handle) else {
            warn!("[cis] member {} missing from stream table", *handle);
            continue;
        };
        let slice = match cig.packing {
            Packing::Sequential => member.airtime_usec(),
            Packing::Interleaved => member.delay_usec,
        };
        sum = sum.wrapping_add(slice);
    }
    sum
}

/// Airtime of one radio packet carrying `payload_len` bytes on the given
/// PHY bitmask. The 14-byte overhead covers preamble, access address,
/// header, MIC and CRC.
#[must_use]
pub fn packet_airtime_usec(phy_mask: u8, payload_len: u16) -> u32 {
    let total = u32::from(payload_len) + 14;
    match phy_mask {
        crate::constants::phy::LE_2M => total * 4,
        crate::constants::phy::LE_CODED => total * 64 + 592,
        _ => total * 8,
    }
}

/// Airtime of one full M->S / S->M exchange including both inter-frame
/// gaps, used as a member's interleaving delay
#[must_use]
pub fn exchange_airtime_usec(phy_m_to_s: u8, tx_len: u16, phy_s_to_m: u8, rx_len: u16) -> u32 {
    packet_airtime_usec(phy_m_to_s, tx_len)
        + T_IFS_USEC
        + packet_airtime_usec(phy_s_to_m, rx_len)
        + T_IFS_USEC
}

/// Channel identifier derived from the access address, as used by channel
/// selection algorithm #2
#[must_use]
pub fn chan_identifier(access_addr: u32) -> u16 {
    ((access_addr >> 16) ^ (access_addr & 0xFFFF)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IsoOptions;
    use crate::acl::AclContext;
    use crate::baseband::testing::MockBaseband;
    use crate::cis::{CigParams, CisParams};
    use crate::constants::phy;
    use heapless::Vec;

    fn test_cis_params(cis_id: u8, nse: u8, sub_interval_usec: u32) -> CisParams {
        CisParams {
            cis_id,
            phy_m_to_s: phy::LE_2M,
            phy_s_to_m: phy::LE_2M,
            max_sdu_m_to_s: 100,
            max_sdu_s_to_m: 100,
            sdu_interval_m_to_s: 10_000,
            sdu_interval_s_to_m: 10_000,
            framed: false,
            max_tx_len: 100,
            max_rx_len: 100,
            nse,
            sub_interval_usec,
            bn_m_to_s: 1,
            bn_s_to_m: 1,
            ft_m_to_s: 1,
            ft_s_to_m: 1,
        }
    }

    fn test_cig(cig_id: u8, packing: u8, streams: &[CisParams]) -> CigParams {
        let mut cis = Vec::new();
        for p in streams {
            cis.push(*p).unwrap();
        }
        CigParams {
            cig_id,
            packing,
            iso_interval: 8, // 10 ms
            cis,
        }
    }

    fn test_acl(handle: u16) -> AclContext {
        let mut acl = AclContext::new(handle);
        acl.event_counter = 100;
        acl.conn_interval_usec = 30_000;
        acl.max_latency = 2;
        acl.due_usec = 1_000_000;
        acl
    }

    struct XorShift(u32);

    impl XorShift {
        fn next(&mut self) -> u32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            x
        }
    }

    #[test]
    fn test_normalize_multiple_iterations() {
        let mut offset: u32 = 95_000;
        let mut ce_ref: u16 = 109;
        normalize(&mut offset, &mut ce_ref, 30_000, 29_000);
        assert_eq!(offset, 5_000);
        assert_eq!(ce_ref, 112);
    }

    #[test]
    fn test_normalize_noop_below_limit() {
        let mut offset: u32 = 7_500;
        let mut ce_ref: u16 = 109;
        normalize(&mut offset, &mut ce_ref, 30_000, 29_000);
        assert_eq!(offset, 7_500);
        assert_eq!(ce_ref, 109);
    }

    #[test]
    fn test_normalize_ce_ref_wraps() {
        let mut offset: u32 = 65_000;
        let mut ce_ref: u16 = 0xFFFF;
        normalize(&mut offset, &mut ce_ref, 30_000, 29_000);
        assert_eq!(offset, 5_000);
        assert_eq!(ce_ref, 1);
    }

    #[test]
    fn test_offset_bound_randomized() {
        let mut rng = XorShift(0x6E2A_9B3D);
        for _ in 0..200 {
            let conn_interval = 7_500 + (rng.next() % 400) * 1_250;
            let nse = (1 + rng.next() % 15) as u8;
            let sub_interval = 1 + rng.next() % (conn_interval / (2 * u32::from(nse)));
            let guard = rng.next() % 600;
            let limit = offset_limit_usec(conn_interval, nse, sub_interval, guard);
            assert!(limit > 0 && limit <= conn_interval);

            let base = rng.next() % limit;
            let folds = rng.next() % 5;
            let mut offset = base + folds * conn_interval;
            let mut ce_ref: u16 = (rng.next() & 0xFFFF) as u16;
            let ce_ref_before = ce_ref;

            normalize(&mut offset, &mut ce_ref, conn_interval, limit);

            assert!(offset < limit);
            assert_eq!(offset, base);
            assert_eq!(ce_ref.wrapping_sub(ce_ref_before), folds as u16);
        }
    }

    #[test]
    fn test_first_offset_anchor_preserved() {
        let opts = IsoOptions::default();
        let mut reg = IsoRegistry::new(&opts);
        let cig = test_cig(1, 0x00, &[test_cis_params(0, 2, 1_000)]);
        let handles = reg.admit_cig(&cig, &opts).unwrap();
        let acl = test_acl(0);

        // free slot large enough to force two normalization folds
        let mut bb = MockBaseband::new();
        bb.free_offset = 63_000;

        let cig_ctx = reg.cig(1).unwrap();
        let cis_ctx = reg.cis(handles[0]).unwrap();
        let plan = first_cis_offset(&acl, cig_ctx, cis_ctx, &opts, None, &mut bb);

        // instant is min_instant + 1 + max_latency events ahead
        assert_eq!(plan.ce_ref, 109 + 2);
        assert_eq!(plan.offset_usec, 3_000);
        assert_eq!(plan.cis_ce_ref, 0);

        // reference at the final ce_ref plus the final offset equals the
        // anchor computed before normalization
        let ref_at_final = acl
            .due_usec
            .wrapping_add(u32::from(plan.ce_ref - acl.event_counter - 1) * acl.conn_interval_usec);
        assert_eq!(ref_at_final.wrapping_add(plan.offset_usec), plan.anchor_usec);
    }

    #[test]
    fn test_first_offset_override() {
        let opts = IsoOptions::default();
        let mut reg = IsoRegistry::new(&opts);
        let cig = test_cig(1, 0x00, &[test_cis_params(0, 2, 1_000)]);
        let handles = reg.admit_cig(&cig, &opts).unwrap();
        let acl = test_acl(0);
        let mut bb = MockBaseband::new();
        bb.free_offset = 63_000;

        let over = crate::OffsetOverride {
            offset_usec: 2_500,
            ce_ref: Some(200),
            widen_max_usec: 300,
        };
        let cig_ctx = reg.cig(1).unwrap();
        let cis_ctx = reg.cis(handles[0]).unwrap();
        let plan = first_cis_offset(&acl, cig_ctx, cis_ctx, &opts, Some(&over), &mut bb);
        assert_eq!(plan.offset_usec, 2_500);
        assert_eq!(plan.ce_ref, 200);
    }

    #[test]
    fn test_subsequent_offset_walks_to_next_occurrence() {
        let opts = IsoOptions::default();
        let mut reg = IsoRegistry::new(&opts);
        let cig = test_cig(
            1,
            0x00,
            &[test_cis_params(0, 2, 1_000), test_cis_params(1, 2, 1_000)],
        );
        let handles = reg.admit_cig(&cig, &opts).unwrap();
        let acl = test_acl(0);
        let bb = MockBaseband::new();

        {
            let cig_ctx = reg.cig_mut(1).unwrap();
            // committed anchor 2.5 ISO periods before the ACL reference
            cig_ctx.anchor_usec = 1_215_000;
        }
        let cig_ctx = reg.cig(1).unwrap();
        let cis_ctx = reg.cis(handles[1]).unwrap();

        // reference: due 1_000_000 + 8 * 30_000 = 1_240_000; occurrences at
        // 1_225_000 and 1_235_000 are not strictly after it, 1_245_000 is
        let plan = subsequent_cis_offset(&acl, cig_ctx, cis_ctx, 0, &opts, &bb);
        assert_eq!(plan.cis_ce_ref, 3);
        assert_eq!(plan.offset_usec, 5_000);
        assert_eq!(plan.ce_ref, 109);
    }

    #[test]
    fn test_subsequent_offset_adds_packing_sum() {
        let opts = IsoOptions::default();
        let mut reg = IsoRegistry::new(&opts);
        let cig = test_cig(
            1,
            0x00,
            &[test_cis_params(0, 2, 1_000), test_cis_params(1, 2, 1_000)],
        );
        let handles = reg.admit_cig(&cig, &opts).unwrap();
        let acl = test_acl(0);
        let bb = MockBaseband::new();

        {
            let cig_ctx = reg.cig_mut(1).unwrap();
            cig_ctx.anchor_usec = 1_215_000;
        }
        reg.insert_member_head(1, handles[0]).unwrap();
        let prior = packing_sum(&reg, reg.cig(1).unwrap());
        assert_eq!(prior, 2_000);

        let cig_ctx = reg.cig(1).unwrap();
        let cis_ctx = reg.cis(handles[1]).unwrap();
        let plan = subsequent_cis_offset(&acl, cig_ctx, cis_ctx, prior, &opts, &bb);
        assert_eq!(plan.offset_usec, 5_000 + 2_000);
        assert_eq!(plan.cis_sync_delay_usec, cig_ctx.sync_delay_usec - 2_000);
    }

    #[test]
    fn test_sequential_packing_sum() {
        let opts = IsoOptions::default();
        let mut reg = IsoRegistry::new(&opts);
        let cig = test_cig(
            1,
            0x00,
            &[
                test_cis_params(0, 2, 1_000),
                test_cis_params(1, 3, 400),
                test_cis_params(2, 1, 5_000),
                test_cis_params(3, 4, 250),
            ],
        );
        let handles = reg.admit_cig(&cig, &opts).unwrap();

        // empty member list
        assert_eq!(packing_sum(&reg, reg.cig(1).unwrap()), 0);

        // one member
        reg.insert_member_head(1, handles[0]).unwrap();
        assert_eq!(packing_sum(&reg, reg.cig(1).unwrap()), 2_000);

        // three more, tail order
        reg.insert_member_tail(1, handles[1]).unwrap();
        reg.insert_member_tail(1, handles[2]).unwrap();
        reg.insert_member_tail(1, handles[3]).unwrap();
        assert_eq!(
            packing_sum(&reg, reg.cig(1).unwrap()),
            2_000 + 1_200 + 5_000 + 1_000
        );
    }

    #[test]
    fn test_interleaved_packing_sum() {
        let opts = IsoOptions::default();
        let mut reg = IsoRegistry::new(&opts);
        let cig = test_cig(
            1,
            0x01,
            &[test_cis_params(0, 2, 1_000), test_cis_params(1, 2, 1_000)],
        );
        let handles = reg.admit_cig(&cig, &opts).unwrap();
        reg.insert_member_head(1, handles[0]).unwrap();
        reg.insert_member_tail(1, handles[1]).unwrap();

        let per_member = exchange_airtime_usec(phy::LE_2M, 100, phy::LE_2M, 100);
        assert_eq!(packing_sum(&reg, reg.cig(1).unwrap()), 2 * per_member);
    }

    #[test]
    fn test_packet_airtime() {
        assert_eq!(packet_airtime_usec(phy::LE_1M, 0), 112);
        assert_eq!(packet_airtime_usec(phy::LE_2M, 100), 456);
        assert_eq!(packet_airtime_usec(phy::LE_CODED, 10), 2_128);
    }

    #[test]
    fn test_chan_identifier() {
        assert_eq!(chan_identifier(0x8E89_BED6), 0x8E89 ^ 0xBED6);
    }
}
