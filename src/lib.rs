#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::too_many_lines)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod acl;
pub mod baseband;
pub mod cis;
pub mod constants;
pub mod manager;
pub mod processor;

use heapless::Vec;

use crate::cis::CigParams;
use crate::constants::{
    DEFAULT_AA_SEED, DEFAULT_LLCP_TIMEOUT_USEC, DEFAULT_MAX_CONN, DEFAULT_MIN_INSTANT,
    DEFAULT_SCHED_GUARD_USEC, DEFAULT_SUB_EVT_SPACE_USEC, MAX_CIS_PER_CIG, MAX_LLCP_PDU_LEN,
};

pub use crate::manager::{IsoManager, PduOut};
pub use crate::processor::IsoChannels;

/// Configuration for the stream engine, injected at construction
///
/// # Examples
///
/// ```rust
/// use lliso::{IsoManager, IsoOptions};
/// use lliso::cis::CisRole;
///
/// // defaults sized for a small LE Audio controller
/// let mgr = IsoManager::new(IsoOptions::default(), CisRole::Central);
///
/// // or tightened for a single-link build
/// let custom = IsoOptions {
///     max_conn: 1,
///     ..IsoOptions::default()
/// };
/// let mgr = IsoManager::new(custom, CisRole::Central);
/// ```
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IsoOptions {
    /// Number of ACL connection handles; CIS handles are allocated
    /// starting right above this value
    pub max_conn: u8,
    /// Minimum number of connection events between sending a request
    /// and its instant
    pub min_instant: u8,
    /// Extra spacing added to every configured sub-event interval, in
    /// microseconds
    pub sub_evt_space_usec: u32,
    /// Scheduler setup time reserved at the tail of a connection event,
    /// in microseconds
    pub sched_guard_usec: u32,
    /// LLCP response timeout in microseconds
    pub llcp_timeout_usec: u32,
    /// Seed for the access-address generator; zero selects the built-in
    /// default
    pub aa_seed: u32,
}

impl Default for IsoOptions {
    fn default() -> Self {
        Self {
            max_conn: DEFAULT_MAX_CONN,
            min_instant: DEFAULT_MIN_INSTANT,
            sub_evt_space_usec: DEFAULT_SUB_EVT_SPACE_USEC,
            sched_guard_usec: DEFAULT_SCHED_GUARD_USEC,
            llcp_timeout_usec: DEFAULT_LLCP_TIMEOUT_USEC,
            aa_seed: DEFAULT_AA_SEED,
        }
    }
}

/// Errors reported directly to the caller.
///
/// Only precondition violations surface here; failures after an attempt
/// has been admitted travel through the event path instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IsoError {
    /// No group with that identifier
    UnknownCig,
    /// No stream with that handle
    UnknownCis,
    /// No connection with that handle
    UnknownAcl,
    /// Parameters failed validation
    InvalidParams,
    /// A fixed-capacity table is full
    Capacity,
    /// The operation does not apply in the current state
    WrongState,
    /// The operation does not apply to the configured role
    WrongRole,
}

impl core::fmt::Display for IsoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::UnknownCig => "unknown cig",
            Self::UnknownCis => "unknown cis",
            Self::UnknownAcl => "unknown acl",
            Self::InvalidParams => "invalid parameters",
            Self::Capacity => "out of capacity",
            Self::WrongState => "wrong state",
            Self::WrongRole => "wrong role",
        };
        f.write_str(s)
    }
}

/// Raw events feeding the dispatcher, produced by the transport, the
/// radio timeline and the engine itself
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkEvent {
    /// A control PDU arrived on an ACL
    LlcpRx {
        /// Carrying connection
        acl_handle: u16,
        /// Raw PDU bytes, opcode first
        data: Vec<u8, MAX_LLCP_PDU_LEN>,
    },
    /// A connection event on an ACL completed
    ConnEvent {
        /// The connection
        acl_handle: u16,
        /// Its event counter after the event
        event_counter: u16,
        /// Absolute due time of the next connection event in
        /// microseconds
        due_usec: u32,
        /// Current baseband time in microseconds
        now_usec: u32,
    },
    /// The connection's supervision timer expired
    SupervisionTimeout {
        /// The dead connection
        acl_handle: u16,
    },
    /// Authentication failure on an established stream
    MicFailure {
        /// The affected stream
        cis_handle: u16,
    },
    /// The host asked to disconnect a stream
    HostDisconnect {
        /// The stream to take down
        cis_handle: u16,
        /// Host-supplied disconnect reason
        reason: u8,
    },
    /// A pending attempt's LLCP response timer fired
    LlcpTimeout {
        /// The waiting stream
        cis_handle: u16,
    },
    /// A local resource shortage ended an attempt
    LocalTerm {
        /// The affected stream
        cis_handle: u16,
    },
    /// Establishment concluded successfully
    EstDone {
        /// The established stream
        cis_handle: u16,
    },
    /// Establishment concluded in failure
    EstFailed {
        /// The failed stream
        cis_handle: u16,
    },
    /// The stream is fully closed at the link layer
    Closed {
        /// The closed stream
        cis_handle: u16,
    },
}

/// Requests from the host into the dispatcher
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostRequest {
    /// Configure a group and allocate handles for its streams
    SetCigParams(CigParams),
    /// Remove an idle group
    RemoveCig {
        /// Group to remove
        cig_id: u8,
    },
    /// Establish a stream on a connection
    CreateCis {
        /// Stream handle from a prior configuration
        cis_handle: u16,
        /// Connection to carry the stream
        acl_handle: u16,
    },
    /// Take down an established stream
    Disconnect {
        /// Stream to take down
        cis_handle: u16,
        /// Reason code sent to the peer
        reason: u8,
    },
}

/// Notifications from the dispatcher back to the host
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostEvent {
    /// Group configured, stream handles allocated in configuration order
    CigConfigured {
        /// The group
        cig_id: u8,
        /// One handle per configured stream
        cis_handles: Vec<u16, MAX_CIS_PER_CIG>,
    },
    /// Group removed
    CigRemoved {
        /// The removed group
        cig_id: u8,
    },
    /// A stream reached the established state
    CisEstablished {
        /// The stream
        cis_handle: u16,
        /// Group synchronization delay in microseconds
        cig_sync_delay_usec: u32,
        /// Stream synchronization delay in microseconds
        cis_sync_delay_usec: u32,
        /// Group ISO interval in microseconds
        iso_interval_usec: u32,
        /// Negotiated number of sub-events
        nse: u8,
        /// Flush timeout, central to peripheral
        ft_m_to_s: u8,
        /// Flush timeout, peripheral to central
        ft_s_to_m: u8,
        /// Burst number, central to peripheral
        bn_m_to_s: u8,
        /// Burst number, peripheral to central
        bn_s_to_m: u8,
        /// Access address assigned to the stream
        access_addr: u32,
    },
    /// An establishment attempt failed
    CisEstablishFailed {
        /// The stream
        cis_handle: u16,
        /// Failure reason code
        reason: u8,
    },
    /// An established stream closed
    CisDisconnected {
        /// The stream
        cis_handle: u16,
        /// Close reason code
        reason: u8,
    },
    /// A request was refused outright
    Error(IsoError),
}

/// Test hook forcing the placement of the next establishment attempt,
/// bypassing slot discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct OffsetOverride {
    /// Offset to use instead of the discovered one, in microseconds
    pub offset_usec: u32,
    /// Force the instant's event counter when set
    pub ce_ref: Option<u16>,
    /// Widen the offered window's upper bound by this many microseconds
    pub widen_max_usec: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = IsoOptions::default();
        assert_eq!(options.max_conn, DEFAULT_MAX_CONN);
        assert_eq!(options.min_instant, DEFAULT_MIN_INSTANT);
        assert_eq!(options.sub_evt_space_usec, DEFAULT_SUB_EVT_SPACE_USEC);
        assert_eq!(options.sched_guard_usec, DEFAULT_SCHED_GUARD_USEC);
        assert_eq!(options.llcp_timeout_usec, DEFAULT_LLCP_TIMEOUT_USEC);
        assert_eq!(options.aa_seed, DEFAULT_AA_SEED);
    }

    #[test]
    fn test_options_customized() {
        let options = IsoOptions {
            max_conn: 2,
            llcp_timeout_usec: 1_000_000,
            ..IsoOptions::default()
        };
        assert_eq!(options.max_conn, 2);
        assert_eq!(options.llcp_timeout_usec, 1_000_000);
        assert_eq!(options.min_instant, DEFAULT_MIN_INSTANT);
    }

    #[test]
    fn test_error_display() {
        let mut s = heapless::String::<32>::new();
        core::fmt::write(&mut s, format_args!("{}", IsoError::WrongState)).unwrap();
        assert_eq!(s.as_str(), "wrong state");
    }
}
