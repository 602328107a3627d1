//! Protocol constants and capacity limits
//!
//! Capacity limits size the fixed storage used by the registry and the event
//! queues. Protocol values (LLCP opcodes, error codes, PHY bits) follow the
//! Bluetooth Core Specification numbering.

/// Maximum number of concurrent CIGs
pub const MAX_CIG: usize = 4;

/// Maximum number of CIS contexts across all CIGs (power of two)
pub const MAX_CIS: usize = 8;

/// Maximum number of CIS members in one CIG
pub const MAX_CIS_PER_CIG: usize = 8;

/// Maximum number of ACL links the engine tracks (power of two)
pub const MAX_ACL_LINKS: usize = 4;

/// Depth of the link-layer event queue
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Depth of the outbound control-PDU queue
pub const TX_QUEUE_DEPTH: usize = 8;

/// Depth of the host notification queue
pub const NOTIF_QUEUE_DEPTH: usize = 8;

/// Depth of the host request channel
pub const REQUEST_QUEUE_DEPTH: usize = 4;

/// Largest control PDU this engine produces or parses (LL_CIS_REQ)
pub const MAX_LLCP_PDU_LEN: usize = 36;

/// Default ACL handle space; CIS handles are allocated above this value
pub const DEFAULT_MAX_CONN: u8 = 4;

/// Default minimum number of connection events before a procedure instant
pub const DEFAULT_MIN_INSTANT: u8 = 6;

/// Default guard time between CIS sub-events in microseconds
pub const DEFAULT_SUB_EVT_SPACE_USEC: u32 = 0;

/// Default scheduler setup lead time reserved at the tail of a connection
/// event, in microseconds
pub const DEFAULT_SCHED_GUARD_USEC: u32 = 500;

/// Default LLCP response timeout in microseconds (40 s procedure window)
pub const DEFAULT_LLCP_TIMEOUT_USEC: u32 = 40_000_000;

/// Default access-address generator seed
pub const DEFAULT_AA_SEED: u32 = 0x6E2A_9B3D;

/// Inter-frame spacing between adjacent packets in microseconds
pub const T_IFS_USEC: u32 = 150;

/// ISO interval wire unit (1.25 ms)
pub const ISO_INTERVAL_UNIT_USEC: u32 = 1250;

/// Advertising channel access address, never assigned to a CIS
pub const ADV_ACCESS_ADDR: u32 = 0x8E89_BED6;

/// LLCP control PDU opcodes
pub mod opcode {
    /// LL_REJECT_EXT_IND
    pub const REJECT_EXT_IND: u8 = 0x11;
    /// LL_CIS_REQ
    pub const CIS_REQ: u8 = 0x1F;
    /// LL_CIS_RSP
    pub const CIS_RSP: u8 = 0x20;
    /// LL_CIS_IND
    pub const CIS_IND: u8 = 0x21;
    /// LL_CIS_TERMINATE_IND
    pub const CIS_TERMINATE_IND: u8 = 0x22;
}

/// Controller error codes carried in terminate and reject PDUs
pub mod reason {
    /// Connection Timeout
    pub const CONN_TIMEOUT: u8 = 0x08;
    /// Connection Rejected due to Limited Resources
    pub const LIMITED_RESOURCES: u8 = 0x0D;
    /// Remote User Terminated Connection
    pub const REMOTE_USER_TERM: u8 = 0x13;
    /// Remote Device Terminated Connection due to Low Resources
    pub const REMOTE_LOW_RESOURCES: u8 = 0x14;
    /// Connection Terminated by Local Host
    pub const LOCAL_HOST_TERM: u8 = 0x16;
    /// LL Response Timeout
    pub const LL_RESP_TIMEOUT: u8 = 0x22;
    /// Connection Terminated due to MIC Failure
    pub const MIC_FAILURE: u8 = 0x3D;
    /// Connection Failed to be Established
    pub const CONN_FAILED_TO_ESTABLISH: u8 = 0x3E;
}

/// PHY selector bits as used in LLCP PHY bitmask fields
pub mod phy {
    /// LE 1M
    pub const LE_1M: u8 = 0x01;
    /// LE 2M
    pub const LE_2M: u8 = 0x02;
    /// LE Coded
    pub const LE_CODED: u8 = 0x04;
}
