///
/// frame.rs
///
/// Abstracted CAN frame data struct shared by every transport backend.
///
use serde::{Deserialize, Serialize};

use crate::error::{CanError, CanResult};

/// Largest valid 11-bit standard identifier.
pub const STANDARD_ID_MAX: u32 = 0x7FF;
/// Largest valid 29-bit extended identifier.
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;
/// Classic CAN payload limit in bytes.
pub const MAX_DLC: usize = 8;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanFrame {
    id: u32,
    data: [u8; 8],
    dlc: usize,
    is_extended: bool,
    is_rtr: bool,
    is_error: bool,
    /// Monotonic seconds since the owning bus was opened.
    timestamp: Option<f64>,
}

impl CanFrame {
    /// Data frame with a standard 11-bit identifier.
    pub fn new(id: u32, data: &[u8]) -> CanResult<Self> {
        Self::validate_id(id, false)?;
        Self::validate_data(data)?;
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            data: buf,
            dlc: data.len(),
            is_extended: false,
            is_rtr: false,
            is_error: false,
            timestamp: None,
        })
    }

    /// Data frame with an extended 29-bit identifier.
    pub fn new_eff(id: u32, data: &[u8]) -> CanResult<Self> {
        Self::validate_id(id, true)?;
        Self::validate_data(data)?;
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            data: buf,
            dlc: data.len(),
            is_extended: true,
            is_rtr: false,
            is_error: false,
            timestamp: None,
        })
    }

    /// Remote request frame. Carries no payload, but the DLC still announces
    /// how many bytes are being requested.
    pub fn new_remote(id: u32, dlc: usize, is_extended: bool) -> CanResult<Self> {
        if dlc > MAX_DLC {
            return Err(CanError::Configuration(format!(
                "RTR frame DLC must be <= {MAX_DLC}, got {dlc}"
            )));
        }
        Self::validate_id(id, is_extended)?;
        Ok(Self {
            id,
            data: [0u8; 8],
            dlc,
            is_extended,
            is_rtr: true,
            is_error: false,
            timestamp: None,
        })
    }

    /// Error frame as reported by the controller.
    pub fn new_error(id: u32) -> CanResult<Self> {
        if id > EXTENDED_ID_MAX {
            return Err(CanError::Configuration(format!(
                "CAN error frame ID must be <= 29 bits, got {id:#x}"
            )));
        }
        Ok(Self {
            id,
            data: [0u8; 8],
            dlc: 0,
            is_extended: false,
            is_rtr: false,
            is_error: true,
            timestamp: None,
        })
    }

    /// Replace the payload in place. The DLC follows the new slice length.
    pub fn set_data(&mut self, data: &[u8]) -> CanResult<()> {
        Self::validate_data(data)?;
        self.data = [0u8; 8];
        self.data[..data.len()].copy_from_slice(data);
        self.dlc = data.len();
        Ok(())
    }

    pub fn set_timestamp(&mut self, ts: Option<f64>) {
        self.timestamp = ts;
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    fn validate_id(id: u32, extended: bool) -> CanResult<()> {
        if extended {
            if id > EXTENDED_ID_MAX {
                return Err(CanError::Configuration(format!(
                    "extended ID must be <= 29 bits (0x1FFFFFFF), got {id:#x}"
                )));
            }
        } else if id > STANDARD_ID_MAX {
            return Err(CanError::Configuration(format!(
                "standard ID must be <= 11 bits (0x7FF), got {id:#x}"
            )));
        }
        Ok(())
    }

    fn validate_data(data: &[u8]) -> CanResult<()> {
        if data.len() > MAX_DLC {
            return Err(CanError::Configuration(format!(
                "CAN data must be <= {MAX_DLC} bytes, got {}",
                data.len()
            )));
        }
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc]
    }
    pub fn dlc(&self) -> usize {
        self.dlc
    }
    pub fn is_extended(&self) -> bool {
        self.is_extended
    }
    pub fn is_rtr(&self) -> bool {
        self.is_rtr
    }
    pub fn is_error(&self) -> bool {
        self.is_error
    }
}
