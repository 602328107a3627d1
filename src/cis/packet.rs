//! LLCP control PDU encoding and decoding for CIS establishment
//!
//! Payload layouts follow the Link Layer control PDU definitions: all
//! multi-byte fields are little-endian, 24-bit fields occupy three wire
//! bytes, and the CIS_REQ SDU-size field carries the framing mode in its
//! top bit.

use crate::constants::{MAX_LLCP_PDU_LEN, opcode};
use heapless::Vec;

/// LLCP codec errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LlcpError {
    /// Payload shorter than the fixed PDU length
    Truncated,
    /// First byte is not a CIS-related opcode
    UnknownOpcode(u8),
    /// Opcode does not match the PDU type being decoded
    OpcodeMismatch,
}

impl core::fmt::Display for LlcpError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Truncated => write!(f, "Control PDU truncated"),
            Self::UnknownOpcode(op) => write!(f, "Unknown control opcode {op:#04x}"),
            Self::OpcodeMismatch => write!(f, "Control opcode mismatch"),
        }
    }
}

fn put_u24(dst: &mut [u8], value: u32) {
    dst.copy_from_slice(&value.to_le_bytes()[..3]);
}

fn get_u24(src: &[u8]) -> u32 {
    u32::from_le_bytes([src[0], src[1], src[2], 0])
}

/// LL_CIS_REQ payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CisReqPdu {
    /// Group identifier
    pub cig_id: u8,
    /// Group-local CIS identifier
    pub cis_id: u8,
    /// PHY bitmask, central to peripheral
    pub phy_m_to_s: u8,
    /// PHY bitmask, peripheral to central
    pub phy_s_to_m: u8,
    /// Maximum SDU size, central to peripheral (12 bits)
    pub max_sdu_m_to_s: u16,
    /// Maximum SDU size, peripheral to central (12 bits)
    pub max_sdu_s_to_m: u16,
    /// Framed SDUs (packed into bit 15 of the M->S SDU-size field)
    pub framed: bool,
    /// SDU interval in microseconds, central to peripheral (20 bits)
    pub sdu_interval_m_to_s: u32,
    /// SDU interval in microseconds, peripheral to central (20 bits)
    pub sdu_interval_s_to_m: u32,
    /// Maximum transmit data-PDU payload length
    pub max_tx_len: u16,
    /// Maximum receive data-PDU payload length
    pub max_rx_len: u16,
    /// Number of sub-events
    pub nse: u8,
    /// Sub-event spacing in microseconds (24 bits)
    pub sub_interval_usec: u32,
    /// Burst number, central to peripheral (low nibble on the wire)
    pub bn_m_to_s: u8,
    /// Burst number, peripheral to central (high nibble on the wire)
    pub bn_s_to_m: u8,
    /// Flush timeout, central to peripheral
    pub ft_m_to_s: u8,
    /// Flush timeout, peripheral to central
    pub ft_s_to_m: u8,
    /// ISO interval in 1.25 ms units
    pub iso_interval: u16,
    /// Lower bound of the offered CIS offset window in microseconds (24 bits)
    pub cis_offset_min_usec: u32,
    /// Upper bound of the offered CIS offset window in microseconds (24 bits)
    pub cis_offset_max_usec: u32,
    /// ACL event counter at which the instant applies
    pub ce_ref: u16,
}

impl CisReqPdu {
    /// Payload size in bytes, opcode included
    pub const SIZE: usize = 36;

    /// Encode into the fixed wire layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0] = opcode::CIS_REQ;
        b[1] = self.cig_id;
        b[2] = self.cis_id;
        b[3] = self.phy_m_to_s;
        b[4] = self.phy_s_to_m;
        let sdu_m = (self.max_sdu_m_to_s & 0x0FFF) | (u16::from(self.framed) << 15);
        b[5..7].copy_from_slice(&sdu_m.to_le_bytes());
        b[7..9].copy_from_slice(&(self.max_sdu_s_to_m & 0x0FFF).to_le_bytes());
        put_u24(&mut b[9..12], self.sdu_interval_m_to_s & 0x000F_FFFF);
        put_u24(&mut b[12..15], self.sdu_interval_s_to_m & 0x000F_FFFF);
        b[15..17].copy_from_slice(&self.max_tx_len.to_le_bytes());
        b[17..19].copy_from_slice(&self.max_rx_len.to_le_bytes());
        b[19] = self.nse;
        put_u24(&mut b[20..23], self.sub_interval_usec & 0x00FF_FFFF);
        b[23] = ((self.bn_s_to_m & 0x0F) << 4) | (self.bn_m_to_s & 0x0F);
        b[24] = self.ft_m_to_s;
        b[25] = self.ft_s_to_m;
        b[26..28].copy_from_slice(&self.iso_interval.to_le_bytes());
        put_u24(&mut b[28..31], self.cis_offset_min_usec & 0x00FF_FFFF);
        put_u24(&mut b[31..34], self.cis_offset_max_usec & 0x00FF_FFFF);
        b[34..36].copy_from_slice(&self.ce_ref.to_le_bytes());
        b
    }

    /// Decode from the fixed wire layout
    ///
    /// # Errors
    /// Returns an error on short input or wrong opcode.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LlcpError> {
        if bytes.len() < Self::SIZE {
            return Err(LlcpError::Truncated);
        }
        if bytes[0] != opcode::CIS_REQ {
            return Err(LlcpError::OpcodeMismatch);
        }
        let sdu_m = u16::from_le_bytes([bytes[5], bytes[6]]);
        let sdu_s = u16::from_le_bytes([bytes[7], bytes[8]]);
        Ok(Self {
            cig_id: bytes[1],
            cis_id: bytes[2],
            phy_m_to_s: bytes[3],
            phy_s_to_m: bytes[4],
            max_sdu_m_to_s: sdu_m & 0x0FFF,
            max_sdu_s_to_m: sdu_s & 0x0FFF,
            framed: (sdu_m >> 15) & 0x1 != 0,
            sdu_interval_m_to_s: get_u24(&bytes[9..12]) & 0x000F_FFFF,
            sdu_interval_s_to_m: get_u24(&bytes[12..15]) & 0x000F_FFFF,
            max_tx_len: u16::from_le_bytes([bytes[15], bytes[16]]),
            max_rx_len: u16::from_le_bytes([bytes[17], bytes[18]]),
            nse: bytes[19],
            sub_interval_usec: get_u24(&bytes[20..23]),
            bn_m_to_s: bytes[23] & 0x0F,
            bn_s_to_m: (bytes[23] >> 4) & 0x0F,
            ft_m_to_s: bytes[24],
            ft_s_to_m: bytes[25],
            iso_interval: u16::from_le_bytes([bytes[26], bytes[27]]),
            cis_offset_min_usec: get_u24(&bytes[28..31]),
            cis_offset_max_usec: get_u24(&bytes[31..34]),
            ce_ref: u16::from_le_bytes([bytes[34], bytes[35]]),
        })
    }
}

/// LL_CIS_RSP payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CisRspPdu {
    /// Lower bound of the peer-accepted offset window in microseconds
    pub cis_offset_min_usec: u32,
    /// Upper bound of the peer-accepted offset window in microseconds
    pub cis_offset_max_usec: u32,
    /// ACL event counter echoed by the peer
    pub ce_ref: u16,
}

impl CisRspPdu {
    /// Payload size in bytes, opcode included
    pub const SIZE: usize = 9;

    /// Encode into the fixed wire layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0] = opcode::CIS_RSP;
        put_u24(&mut b[1..4], self.cis_offset_min_usec & 0x00FF_FFFF);
        put_u24(&mut b[4..7], self.cis_offset_max_usec & 0x00FF_FFFF);
        b[7..9].copy_from_slice(&self.ce_ref.to_le_bytes());
        b
    }

    /// Decode from the fixed wire layout
    ///
    /// # Errors
    /// Returns an error on short input or wrong opcode.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LlcpError> {
        if bytes.len() < Self::SIZE {
            return Err(LlcpError::Truncated);
        }
        if bytes[0] != opcode::CIS_RSP {
            return Err(LlcpError::OpcodeMismatch);
        }
        Ok(Self {
            cis_offset_min_usec: get_u24(&bytes[1..4]),
            cis_offset_max_usec: get_u24(&bytes[4..7]),
            ce_ref: u16::from_le_bytes([bytes[7], bytes[8]]),
        })
    }
}

/// LL_CIS_IND payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CisIndPdu {
    /// Access address assigned to the CIS
    pub access_addr: u32,
    /// Final CIS offset from the instant in microseconds (24 bits)
    pub cis_offset_usec: u32,
    /// CIG synchronization delay in microseconds (24 bits)
    pub cig_sync_delay_usec: u32,
    /// CIS synchronization delay in microseconds (24 bits)
    pub cis_sync_delay_usec: u32,
    /// ACL event counter at which the instant applies
    pub ce_ref: u16,
}

impl CisIndPdu {
    /// Payload size in bytes, opcode included
    pub const SIZE: usize = 16;

    /// Encode into the fixed wire layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0] = opcode::CIS_IND;
        b[1..5].copy_from_slice(&self.access_addr.to_le_bytes());
        put_u24(&mut b[5..8], self.cis_offset_usec & 0x00FF_FFFF);
        put_u24(&mut b[8..11], self.cig_sync_delay_usec & 0x00FF_FFFF);
        put_u24(&mut b[11..14], self.cis_sync_delay_usec & 0x00FF_FFFF);
        b[14..16].copy_from_slice(&self.ce_ref.to_le_bytes());
        b
    }

    /// Decode from the fixed wire layout
    ///
    /// # Errors
    /// Returns an error on short input or wrong opcode.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LlcpError> {
        if bytes.len() < Self::SIZE {
            return Err(LlcpError::Truncated);
        }
        if bytes[0] != opcode::CIS_IND {
            return Err(LlcpError::OpcodeMismatch);
        }
        Ok(Self {
            access_addr: u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            cis_offset_usec: get_u24(&bytes[5..8]),
            cig_sync_delay_usec: get_u24(&bytes[8..11]),
            cis_sync_delay_usec: get_u24(&bytes[11..14]),
            ce_ref: u16::from_le_bytes([bytes[14], bytes[15]]),
        })
    }
}

/// LL_CIS_TERMINATE_IND payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CisTerminateIndPdu {
    /// Group identifier
    pub cig_id: u8,
    /// Group-local CIS identifier
    pub cis_id: u8,
    /// Controller error code for the termination
    pub reason: u8,
}

impl CisTerminateIndPdu {
    /// Payload size in bytes, opcode included
    pub const SIZE: usize = 4;

    /// Encode into the fixed wire layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        [opcode::CIS_TERMINATE_IND, self.cig_id, self.cis_id, self.reason]
    }

    /// Decode from the fixed wire layout
    ///
    /// # Errors
    /// Returns an error on short input or wrong opcode.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LlcpError> {
        if bytes.len() < Self::SIZE {
            return Err(LlcpError::Truncated);
        }
        if bytes[0] != opcode::CIS_TERMINATE_IND {
            return Err(LlcpError::OpcodeMismatch);
        }
        Ok(Self {
            cig_id: bytes[1],
            cis_id: bytes[2],
            reason: bytes[3],
        })
    }
}

/// LL_REJECT_EXT_IND payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectExtIndPdu {
    /// Opcode of the PDU being rejected
    pub reject_opcode: u8,
    /// Controller error code for the rejection
    pub reason: u8,
}

impl RejectExtIndPdu {
    /// Payload size in bytes, opcode included
    pub const SIZE: usize = 3;

    /// Encode into the fixed wire layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        [opcode::REJECT_EXT_IND, self.reject_opcode, self.reason]
    }

    /// Decode from the fixed wire layout
    ///
    /// # Errors
    /// Returns an error on short input or wrong opcode.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LlcpError> {
        if bytes.len() < Self::SIZE {
            return Err(LlcpError::Truncated);
        }
        if bytes[0] != opcode::REJECT_EXT_IND {
            return Err(LlcpError::OpcodeMismatch);
        }
        Ok(Self {
            reject_opcode: bytes[1],
            reason: bytes[2],
        })
    }
}

/// A decoded CIS-related control PDU, tagged by opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlPdu {
    /// LL_CIS_REQ
    CisReq(CisReqPdu),
    /// LL_CIS_RSP
    CisRsp(CisRspPdu),
    /// LL_CIS_IND
    CisInd(CisIndPdu),
    /// LL_CIS_TERMINATE_IND
    CisTerminateInd(CisTerminateIndPdu),
    /// LL_REJECT_EXT_IND
    RejectExtInd(RejectExtIndPdu),
}

impl CtrlPdu {
    /// Decode a received control PDU by its opcode byte
    ///
    /// # Errors
    /// Returns an error on empty input, short input, or an opcode this
    /// engine does not handle.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LlcpError> {
        let op = *bytes.first().ok_or(LlcpError::Truncated)?;
        match op {
            opcode::CIS_REQ => CisReqPdu::from_bytes(bytes).map(Self::CisReq),
            opcode::CIS_RSP => CisRspPdu::from_bytes(bytes).map(Self::CisRsp),
            opcode::CIS_IND => CisIndPdu::from_bytes(bytes).map(Self::CisInd),
            opcode::CIS_TERMINATE_IND => {
                CisTerminateIndPdu::from_bytes(bytes).map(Self::CisTerminateInd)
            }
            opcode::REJECT_EXT_IND => RejectExtIndPdu::from_bytes(bytes).map(Self::RejectExtInd),
            other => Err(LlcpError::UnknownOpcode(other)),
        }
    }

    /// Encode for transmission
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8, MAX_LLCP_PDU_LEN> {
        let mut out = Vec::new();
        let ok = match self {
            Self::CisReq(pdu) => out.extend_from_slice(&pdu.to_bytes()),
            Self::CisRsp(pdu) => out.extend_from_slice(&pdu.to_bytes()),
            Self::CisInd(pdu) => out.extend_from_slice(&pdu.to_bytes()),
            Self::CisTerminateInd(pdu) => out.extend_from_slice(&pdu.to_bytes()),
            Self::RejectExtInd(pdu) => out.extend_from_slice(&pdu.to_bytes()),
        };
        debug_assert!(ok.is_ok());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cis_req() -> CisReqPdu {
        CisReqPdu {
            cig_id: 1,
            cis_id: 0,
            phy_m_to_s: 0x02,
            phy_s_to_m: 0x02,
            max_sdu_m_to_s: 0x0F3,
            max_sdu_s_to_m: 0x0A0,
            framed: true,
            sdu_interval_m_to_s: 10_000,
            sdu_interval_s_to_m: 10_000,
            max_tx_len: 251,
            max_rx_len: 251,
            nse: 2,
            sub_interval_usec: 1000,
            bn_m_to_s: 1,
            bn_s_to_m: 2,
            ft_m_to_s: 3,
            ft_s_to_m: 4,
            iso_interval: 8,
            cis_offset_min_usec: 7500,
            cis_offset_max_usec: 7800,
            ce_ref: 109,
        }
    }

    #[test]
    fn test_cis_req_round_trip() {
        let pdu = sample_cis_req();
        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), CisReqPdu::SIZE);
        let decoded = CisReqPdu::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn test_cis_req_framing_bit() {
        let mut pdu = sample_cis_req();
        pdu.framed = true;
        let bytes = pdu.to_bytes();
        // framing lives in bit 15 of the M->S SDU-size field at offset 5..7
        assert_eq!(bytes[6] & 0x80, 0x80);
        assert!(CisReqPdu::from_bytes(&bytes).unwrap().framed);

        pdu.framed = false;
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[6] & 0x80, 0x00);
        assert!(!CisReqPdu::from_bytes(&bytes).unwrap().framed);
        // the 12-bit SDU size is unaffected either way
        assert_eq!(
            CisReqPdu::from_bytes(&bytes).unwrap().max_sdu_m_to_s,
            0x0F3
        );
    }

    #[test]
    fn test_cis_req_bn_nibbles() {
        let pdu = sample_cis_req();
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[23], 0x21); // S->M high nibble, M->S low nibble
        let decoded = CisReqPdu::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.bn_m_to_s, 1);
        assert_eq!(decoded.bn_s_to_m, 2);
    }

    #[test]
    fn test_cis_ind_wire_layout() {
        let pdu = CisIndPdu {
            access_addr: 0x1234_5678,
            cis_offset_usec: 0x00_C350,     // 50000
            cig_sync_delay_usec: 0x00_0BB8, // 3000
            cis_sync_delay_usec: 0x00_07D0, // 2000
            ce_ref: 0x016D,
        };
        let bytes = pdu.to_bytes();
        assert_eq!(
            bytes,
            [
                0x21, 0x78, 0x56, 0x34, 0x12, 0x50, 0xC3, 0x00, 0xB8, 0x0B, 0x00, 0xD0, 0x07,
                0x00, 0x6D, 0x01,
            ]
        );
        assert_eq!(CisIndPdu::from_bytes(&bytes).unwrap(), pdu);
    }

    #[test]
    fn test_cis_rsp_round_trip() {
        let pdu = CisRspPdu {
            cis_offset_min_usec: 500,
            cis_offset_max_usec: 12_000,
            ce_ref: 220,
        };
        let decoded = CisRspPdu::from_bytes(&pdu.to_bytes()).unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn test_terminate_and_reject() {
        let term = CisTerminateIndPdu {
            cig_id: 2,
            cis_id: 1,
            reason: 0x13,
        };
        assert_eq!(term.to_bytes(), [0x22, 0x02, 0x01, 0x13]);
        assert_eq!(CisTerminateIndPdu::from_bytes(&term.to_bytes()).unwrap(), term);

        let rej = RejectExtIndPdu {
            reject_opcode: 0x1F,
            reason: 0x0D,
        };
        assert_eq!(rej.to_bytes(), [0x11, 0x1F, 0x0D]);
        assert_eq!(RejectExtIndPdu::from_bytes(&rej.to_bytes()).unwrap(), rej);
    }

    #[test]
    fn test_ctrl_pdu_dispatch() {
        let req = sample_cis_req();
        match CtrlPdu::from_bytes(&req.to_bytes()).unwrap() {
            CtrlPdu::CisReq(decoded) => assert_eq!(decoded, req),
            other => panic!("wrong variant: {other:?}"),
        }

        assert_eq!(CtrlPdu::from_bytes(&[]), Err(LlcpError::Truncated));
        assert_eq!(CtrlPdu::from_bytes(&[0x55]), Err(LlcpError::UnknownOpcode(0x55)));
        assert_eq!(CtrlPdu::from_bytes(&[0x1F, 0x00]), Err(LlcpError::Truncated));
    }
}
