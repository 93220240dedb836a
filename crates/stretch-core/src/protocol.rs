use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unvalidated;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validated;

pub const DEFAULT_L0_MM: f64 = 28.5;
pub const DEFAULT_STRAIN_PCT: f64 = 18.0;
pub const DEFAULT_STRAIN_RATE_PCT_S: f64 = 5.0;
pub const DEFAULT_CYCLES: u32 = 1000;

/// One cyclic tension/compression test.
///
/// `strain_pct` is the amplitude relative to `l0_mm`. The actuator always
/// travels toward zero from wherever the carriage sits at run start, so the
/// sign only matters for the timing estimate's magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Protocol<State = Unvalidated> {
    l0_mm: f64,
    strain_pct: f64,
    strain_rate_pct_s: f64,
    cycles: u32,
    #[serde(skip)]
    _state: PhantomData<State>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("protocol field `{field}` is missing")]
    Missing { field: &'static str },
    #[error("protocol field `{field}` is not a valid number: {value:?}")]
    NotNumeric { field: &'static str, value: String },
    #[error("protocol field `{field}` is not finite: {value}")]
    NonFinite { field: &'static str, value: f64 },
    #[error("L0 must be greater than zero (got {value} mm)")]
    NonPositiveLength { value: f64 },
    #[error("strain rate must be greater than zero (got {value} %/s)")]
    NonPositiveStrainRate { value: f64 },
    #[error("strain must be non-zero")]
    ZeroStrain,
}

impl Protocol<Unvalidated> {
    pub fn new(l0_mm: f64, strain_pct: f64, strain_rate_pct_s: f64, cycles: u32) -> Self {
        Self {
            l0_mm,
            strain_pct,
            strain_rate_pct_s,
            cycles,
            _state: PhantomData,
        }
    }

    /// Builds a protocol from raw text fields as typed into an entry form.
    pub fn from_fields(
        l0_mm: &str,
        strain_pct: &str,
        strain_rate_pct_s: &str,
        cycles: &str,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            parse_field("l0", l0_mm)?,
            parse_field("strain", strain_pct)?,
            parse_field("strain_rate", strain_rate_pct_s)?,
            parse_field("cycles", cycles)?,
        ))
    }

    pub fn validate(self) -> Result<Protocol<Validated>, ProtocolError> {
        for (field, value) in [
            ("l0", self.l0_mm),
            ("strain", self.strain_pct),
            ("strain_rate", self.strain_rate_pct_s),
        ] {
            if !value.is_finite() {
                return Err(ProtocolError::NonFinite { field, value });
            }
        }
        if self.l0_mm <= 0.0 {
            return Err(ProtocolError::NonPositiveLength { value: self.l0_mm });
        }
        if self.strain_rate_pct_s <= 0.0 {
            return Err(ProtocolError::NonPositiveStrainRate {
                value: self.strain_rate_pct_s,
            });
        }
        if self.strain_pct == 0.0 {
            return Err(ProtocolError::ZeroStrain);
        }

        Ok(Protocol {
            l0_mm: self.l0_mm,
            strain_pct: self.strain_pct,
            strain_rate_pct_s: self.strain_rate_pct_s,
            cycles: self.cycles,
            _state: PhantomData,
        })
    }
}

impl Default for Protocol<Unvalidated> {
    fn default() -> Self {
        Self::new(
            DEFAULT_L0_MM,
            DEFAULT_STRAIN_PCT,
            DEFAULT_STRAIN_RATE_PCT_S,
            DEFAULT_CYCLES,
        )
    }
}

impl<State> Protocol<State> {
    pub fn l0_mm(&self) -> f64 {
        self.l0_mm
    }

    pub fn strain_pct(&self) -> f64 {
        self.strain_pct
    }

    pub fn strain_rate_pct_s(&self) -> f64 {
        self.strain_rate_pct_s
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }
}

impl Protocol<Validated> {
    pub fn motion_plan(&self) -> MotionPlan {
        MotionPlan::from_protocol(self)
    }
}

fn parse_field<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ProtocolError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Missing { field });
    }
    trimmed.parse().map_err(|_| ProtocolError::NotNumeric {
        field,
        value: raw.to_string(),
    })
}

/// Motion parameters derived from a validated protocol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotionPlan {
    /// Distance of one single-direction traversal.
    pub travel_mm: f64,
    /// Time one traversal should take.
    pub traversal_s: f64,
    pub speed_mm_s: f64,
    pub cycles: u32,
}

impl MotionPlan {
    fn from_protocol(protocol: &Protocol<Validated>) -> Self {
        let l0 = protocol.l0_mm;
        let travel_mm = (l0 - l0 * (100.0 + protocol.strain_pct) / 100.0).abs();
        let traversal_s = protocol.strain_pct.abs() / protocol.strain_rate_pct_s;
        Self {
            travel_mm,
            traversal_s,
            speed_mm_s: travel_mm / traversal_s,
            cycles: protocol.cycles,
        }
    }

    /// Two traversals (out and back) per outstanding cycle.
    pub fn seconds_remaining(&self, cycles_completed: u32) -> f64 {
        let outstanding = self.cycles.saturating_sub(cycles_completed);
        self.traversal_s * f64::from(outstanding) * 2.0
    }
}
