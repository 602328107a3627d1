//! Seam to the baseband scheduler and radio
//!
//! The engine never talks to hardware directly. Everything it needs from
//! the scheduler, slot discovery, periodic registration, descriptor
//! build/commit and per-stream encryption setup, goes through this trait
//! so the whole establishment flow runs on the host against a mock.

/// Bias applied when the scheduler places a periodic activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedPreference {
    /// Favor tight, low-latency placement
    Performance,
    /// Favor packing density over placement quality
    Capacity,
}

/// Operations the CIS engine requires from the baseband
pub trait IsoBaseband {
    /// Current baseband clock in microseconds; wraps at 32 bits
    fn now_usec(&self) -> u32;

    /// Signed microseconds from `ref_usec` to `target_usec` on the
    /// wrapping clock
    fn time_delta(&self, target_usec: u32, ref_usec: u32) -> i32 {
        target_usec.wrapping_sub(ref_usec) as i32
    }

    /// Earliest free offset within one period of the given activity,
    /// measured from `ref_usec`
    fn min_free_offset(&mut self, period_usec: u32, cig_id: u8, ref_usec: u32) -> u32;

    /// Add a periodic activity for the group. Returns `false` when the
    /// scheduler cannot admit it. Idempotency is the caller's concern.
    fn register_cig(
        &mut self,
        cig_id: u8,
        pref: SchedPreference,
        min_period_usec: u32,
        max_period_usec: u32,
        lead_time_usec: u32,
    ) -> bool;

    /// Remove the group's periodic activity
    fn unregister_cig(&mut self, cig_id: u8);

    /// Build the group-level operation descriptor around its first stream
    fn build_cig_op(&mut self, cig_id: u8, cis_handle: u16);

    /// Add one stream's contribution to an already built group descriptor
    fn build_cis_op(&mut self, cig_id: u8, cis_handle: u16);

    /// Hand the built group operation to the scheduler with its anchor
    fn commit_cig_op(&mut self, cig_id: u8, anchor_usec: u32);

    /// Load the stream's encryption parameters into the radio
    fn setup_encryption(&mut self, cis_handle: u16);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{IsoBaseband, SchedPreference};

    /// Scripted baseband double recording every call
    pub struct MockBaseband {
        pub now: u32,
        pub free_offset: u32,
        pub register_ok: bool,
        pub register_calls: usize,
        pub unregister_calls: usize,
        pub build_cig_calls: usize,
        pub build_cis_calls: usize,
        pub commit_calls: usize,
        pub encrypt_calls: usize,
        pub last_register: Option<(u8, u32, u32, u32)>,
        pub last_free_offset_query: Option<(u32, u8, u32)>,
        pub last_commit: Option<(u8, u32)>,
        pub last_build_cis: Option<(u8, u16)>,
    }

    impl MockBaseband {
        pub fn new() -> Self {
            Self {
                now: 0,
                free_offset: 7_500,
                register_ok: true,
                register_calls: 0,
                unregister_calls: 0,
                build_cig_calls: 0,
                build_cis_calls: 0,
                commit_calls: 0,
                encrypt_calls: 0,
                last_register: None,
                last_free_offset_query: None,
                last_commit: None,
                last_build_cis: None,
            }
        }
    }

    impl IsoBaseband for MockBaseband {
        fn now_usec(&self) -> u32 {
            self.now
        }

        fn min_free_offset(&mut self, period_usec: u32, cig_id: u8, ref_usec: u32) -> u32 {
            self.last_free_offset_query = Some((period_usec, cig_id, ref_usec));
            self.free_offset
        }

        fn register_cig(
            &mut self,
            cig_id: u8,
            _pref: SchedPreference,
            min_period_usec: u32,
            max_period_usec: u32,
            lead_time_usec: u32,
        ) -> bool {
            self.register_calls += 1;
            self.last_register = Some((cig_id, min_period_usec, max_period_usec, lead_time_usec));
            self.register_ok
        }

        fn unregister_cig(&mut self, _cig_id: u8) {
            self.unregister_calls += 1;
        }

        fn build_cig_op(&mut self, _cig_id: u8, _cis_handle: u16) {
            self.build_cig_calls += 1;
        }

        fn build_cis_op(&mut self, cig_id: u8, cis_handle: u16) {
            self.build_cis_calls += 1;
            self.last_build_cis = Some((cig_id, cis_handle));
        }

        fn commit_cig_op(&mut self, cig_id: u8, anchor_usec: u32) {
            self.commit_calls += 1;
            self.last_commit = Some((cig_id, anchor_usec));
        }

        fn setup_encryption(&mut self, _cis_handle: u16) {
            self.encrypt_calls += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::MockBaseband;

    #[test]
    fn test_time_delta_wraps() {
        let bb = MockBaseband::new();
        assert_eq!(bb.time_delta(100, 50), 50);
        assert_eq!(bb.time_delta(50, 100), -50);
        // across the 32-bit boundary
        assert_eq!(bb.time_delta(10, u32::MAX - 9), 20);
        assert_eq!(bb.time_delta(u32::MAX - 9, 10), -20);
    }
}
