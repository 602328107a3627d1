//! Connected Isochronous Stream (CIS) engine
//!
//! This module implements CIS/CIG establishment and lifecycle management on
//! top of an existing ACL link: offset arithmetic against the ACL anchor
//! ([`timing`]), context and membership storage ([`registry`]), the LLCP
//! handshake ([`engine`] and [`packet`]), and the per-CIS lifecycle state
//! machine ([`machine`]).

pub mod engine;
pub mod machine;
pub mod packet;
pub mod registry;
pub mod timing;

use crate::constants::reason;
use heapless::Vec;

pub use machine::{CisAction, CisEvent, CisState};
pub use registry::{CigContext, CisContext, IsoRegistry};

/// CIS packing policy within one CIG event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Packing {
    /// Members occupy back-to-back airtime slices
    Sequential = 0x00,
    /// Members alternate sub-events within the CIG event
    Interleaved = 0x01,
}

impl Packing {
    /// Convert from the raw host-supplied byte
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Sequential),
            0x01 => Some(Self::Interleaved),
            _ => None,
        }
    }
}

/// Link Layer role for a CIS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CisRole {
    /// Initiator of the establishment handshake
    Central,
    /// Acceptor of the establishment handshake
    Peripheral,
}

/// Why a CIS ended or failed to establish
///
/// Captured into the CIS context by the failure path or event remap that
/// first learns the cause, then reported to the host unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TerminateReason {
    /// CIG invalid or scheduler could not admit the stream
    LocalResources,
    /// Peer answered the CIS_REQ with a reject, carrying its error code
    PeerRejected(u8),
    /// No peer response within the LLCP response window
    LlcpTimeout,
    /// Supervision timeout on the owning ACL link
    ConnTimeout,
    /// MIC failure on the CIS
    MicFailure,
    /// Host-requested disconnect with the host-supplied error code
    LocalHost(u8),
    /// Peer sent CIS_TERMINATE_IND with this error code
    PeerTerminated(u8),
}

impl TerminateReason {
    /// Controller error code reported to the host for this reason
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::LocalResources => reason::LIMITED_RESOURCES,
            Self::LlcpTimeout => reason::LL_RESP_TIMEOUT,
            Self::ConnTimeout => reason::CONN_TIMEOUT,
            Self::MicFailure => reason::MIC_FAILURE,
            Self::PeerRejected(code) | Self::LocalHost(code) | Self::PeerTerminated(code) => code,
        }
    }
}

/// Host-validated parameters for one CIS within a CIG
///
/// Range validation happens in the host-command layer before these reach the
/// engine; only the packing byte of the owning CIG is re-checked here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CisParams {
    /// Group-local CIS identifier
    pub cis_id: u8,
    /// PHY bitmask, central to peripheral direction
    pub phy_m_to_s: u8,
    /// PHY bitmask, peripheral to central direction
    pub phy_s_to_m: u8,
    /// Maximum SDU size, central to peripheral (12 bits)
    pub max_sdu_m_to_s: u16,
    /// Maximum SDU size, peripheral to central (12 bits)
    pub max_sdu_s_to_m: u16,
    /// SDU interval in microseconds, central to peripheral (20 bits)
    pub sdu_interval_m_to_s: u32,
    /// SDU interval in microseconds, peripheral to central (20 bits)
    pub sdu_interval_s_to_m: u32,
    /// Framed (true) or unframed (false) SDUs
    pub framed: bool,
    /// Maximum transmit data-PDU payload length
    pub max_tx_len: u16,
    /// Maximum receive data-PDU payload length
    pub max_rx_len: u16,
    /// Number of sub-events per CIS event
    pub nse: u8,
    /// Sub-event spacing in microseconds
    pub sub_interval_usec: u32,
    /// Burst number, central to peripheral
    pub bn_m_to_s: u8,
    /// Burst number, peripheral to central
    pub bn_s_to_m: u8,
    /// Flush timeout in ISO intervals, central to peripheral
    pub ft_m_to_s: u8,
    /// Flush timeout in ISO intervals, peripheral to central
    pub ft_s_to_m: u8,
}

/// Host-validated parameters for a CIG and all of its CIS definitions
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CigParams {
    /// Group identifier (0x00..=0xEF)
    pub cig_id: u8,
    /// Raw packing byte; validated against [`Packing`] at admission
    pub packing: u8,
    /// ISO interval in 1.25 ms units
    pub iso_interval: u16,
    /// Per-CIS parameter sets, in definition order
    pub cis: Vec<CisParams, { crate::constants::MAX_CIS_PER_CIG }>,
}
