//! Unit tags carried in device replies and their conversion to canonical units.
//!
//! Canonical units are µL/min for flow rate and µL for volume. The tables here
//! are part of the wire contract: a wrong factor silently corrupts whatever
//! control loop consumes the value.

use crate::error::{AdapterError, AdapterResult};

/// Flow rate unit tag (two letters on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowRateUnit {
    /// `UM`: µL/min
    MicrolitersPerMinute,
    /// `UH`: µL/hr
    MicrolitersPerHour,
    /// `MM`: mL/min
    MillilitersPerMinute,
    /// `MH`: mL/hr
    MillilitersPerHour,
}

impl FlowRateUnit {
    /// Parse a wire tag such as `UH`.
    pub fn from_code(code: &str) -> AdapterResult<Self> {
        match code.trim() {
            "UM" => Ok(Self::MicrolitersPerMinute),
            "UH" => Ok(Self::MicrolitersPerHour),
            "MM" => Ok(Self::MillilitersPerMinute),
            "MH" => Ok(Self::MillilitersPerHour),
            other => Err(AdapterError::UnrecognizedResponse(format!(
                "unknown flow rate unit '{}'",
                other
            ))),
        }
    }

    /// Wire tag for this unit.
    pub fn code(self) -> &'static str {
        match self {
            Self::MicrolitersPerMinute => "UM",
            Self::MicrolitersPerHour => "UH",
            Self::MillilitersPerMinute => "MM",
            Self::MillilitersPerHour => "MH",
        }
    }

    /// Convert a value in this unit to µL/min.
    pub fn to_ul_per_min(self, value: f64) -> f64 {
        match self {
            Self::MicrolitersPerMinute => value,
            Self::MicrolitersPerHour => value / 60.0,
            Self::MillilitersPerMinute => value * 1000.0,
            Self::MillilitersPerHour => value * 1000.0 / 60.0,
        }
    }
}

/// Volume unit tag (one letter followed by `L` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeUnit {
    /// `U`: µL
    Microliters,
    /// `M`: mL
    Milliliters,
}

impl VolumeUnit {
    /// Parse the leading letter of `UL` / `ML`.
    pub fn from_code(code: &str) -> AdapterResult<Self> {
        match code.trim().chars().next() {
            Some('U') => Ok(Self::Microliters),
            Some('M') => Ok(Self::Milliliters),
            _ => Err(AdapterError::UnrecognizedResponse(format!(
                "unknown volume unit '{}'",
                code
            ))),
        }
    }

    /// Convert a value in this unit to µL.
    pub fn to_ul(self, value: f64) -> f64 {
        match self {
            Self::Microliters => value,
            Self::Milliliters => value * 1000.0,
        }
    }
}
