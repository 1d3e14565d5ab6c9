//! Core data types for radio-source localization.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::core::constants::{DEFAULT_RANGING_STD_DEV, DEFAULT_RSSI_STD_DEV};

/// Receiver or source position in local Cartesian coordinates.
///
/// The two variants carry the planar and spatial cases; all estimators
/// dispatch on the variant instead of being parameterised over dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Point {
    TwoD([f64; 2]),
    ThreeD([f64; 3]),
}

impl Point {
    /// Number of inhomogeneous coordinates (2 or 3).
    pub fn dims(&self) -> usize {
        match self {
            Point::TwoD(_) => 2,
            Point::ThreeD(_) => 3,
        }
    }

    /// Coordinate access by index.
    ///
    /// # Panics
    ///
    /// Panics if `i >= dims()`.
    pub fn coord(&self, i: usize) -> f64 {
        self.coords()[i]
    }

    pub fn coords(&self) -> &[f64] {
        match self {
            Point::TwoD(c) => c,
            Point::ThreeD(c) => c,
        }
    }

    /// Builds a point from a coordinate slice of length 2 or 3.
    pub fn from_coords(coords: &[f64]) -> Option<Point> {
        match coords {
            [x, y] => Some(Point::TwoD([*x, *y])),
            [x, y, z] => Some(Point::ThreeD([*x, *y, *z])),
            _ => None,
        }
    }

    /// Squared Euclidean distance to another point of the same dimension.
    pub fn sq_distance_to(&self, other: &Point) -> f64 {
        self.coords()
            .iter()
            .zip(other.coords())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        self.sq_distance_to(other).sqrt()
    }

    /// Coordinate-wise mean of a non-empty set of same-dimension points.
    pub fn centroid(points: &[Point]) -> Option<Point> {
        let first = points.first()?;
        let dims = first.dims();
        let mut acc = [0.0f64; 3];
        for p in points {
            if p.dims() != dims {
                return None;
            }
            for (a, c) in acc.iter_mut().zip(p.coords()) {
                *a += c;
            }
        }
        let n = points.len() as f64;
        Point::from_coords(
            &acc[..dims]
                .iter()
                .map(|a| a / n)
                .collect::<Vec<_>>(),
        )
    }
}

/// Identity and radio characteristics of an emitting source.
///
/// Readings reference the source whose parameters are being estimated; the
/// carrier frequency feeds the free-space term of the path-loss model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioSource {
    pub identifier: String,
    pub frequency_hz: f64,
}

impl RadioSource {
    pub fn new(identifier: impl Into<String>, frequency_hz: f64) -> Self {
        Self {
            identifier: identifier.into(),
            frequency_hz,
        }
    }
}

/// Measured value carried by a reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Measurement {
    /// Received signal strength in dBm.
    Rssi {
        rssi_dbm: f64,
        std_dev: Option<f64>,
    },
    /// Measured distance in meters.
    Ranging {
        distance_m: f64,
        std_dev: Option<f64>,
    },
    /// Both a distance and a signal strength from the same observation.
    RangingAndRssi {
        distance_m: f64,
        distance_std_dev: Option<f64>,
        rssi_dbm: f64,
        rssi_std_dev: Option<f64>,
    },
}

impl Measurement {
    pub fn rssi_dbm(&self) -> Option<f64> {
        match self {
            Measurement::Rssi { rssi_dbm, .. }
            | Measurement::RangingAndRssi { rssi_dbm, .. } => Some(*rssi_dbm),
            Measurement::Ranging { .. } => None,
        }
    }

    /// RSSI standard deviation, falling back to the crate default.
    pub fn rssi_std_dev(&self) -> f64 {
        match self {
            Measurement::Rssi { std_dev, .. } => std_dev.unwrap_or(DEFAULT_RSSI_STD_DEV),
            Measurement::RangingAndRssi { rssi_std_dev, .. } => {
                rssi_std_dev.unwrap_or(DEFAULT_RSSI_STD_DEV)
            }
            Measurement::Ranging { .. } => DEFAULT_RSSI_STD_DEV,
        }
    }

    pub fn distance_m(&self) -> Option<f64> {
        match self {
            Measurement::Ranging { distance_m, .. }
            | Measurement::RangingAndRssi { distance_m, .. } => Some(*distance_m),
            Measurement::Rssi { .. } => None,
        }
    }

    /// Ranging standard deviation, falling back to the crate default.
    pub fn distance_std_dev(&self) -> f64 {
        match self {
            Measurement::Ranging { std_dev, .. } => std_dev.unwrap_or(DEFAULT_RANGING_STD_DEV),
            Measurement::RangingAndRssi {
                distance_std_dev, ..
            } => distance_std_dev.unwrap_or(DEFAULT_RANGING_STD_DEV),
            Measurement::Rssi { .. } => DEFAULT_RANGING_STD_DEV,
        }
    }
}

/// One observation of a source made at a known receiver position.
///
/// Immutable once constructed. All readings supplied to one estimation call
/// must reference the same physical source; this is a caller precondition
/// and is not re-validated per reading.
#[derive(Debug, Clone)]
pub struct Reading {
    source: RadioSource,
    position: Point,
    position_covariance: Option<DMatrix<f64>>,
    measurement: Measurement,
}

impl Reading {
    /// RSSI-only reading.
    pub fn rssi(source: RadioSource, position: Point, rssi_dbm: f64, std_dev: Option<f64>) -> Self {
        Self {
            source,
            position,
            position_covariance: None,
            measurement: Measurement::Rssi { rssi_dbm, std_dev },
        }
    }

    /// Ranging-only reading.
    pub fn ranging(
        source: RadioSource,
        position: Point,
        distance_m: f64,
        std_dev: Option<f64>,
    ) -> Self {
        Self {
            source,
            position,
            position_covariance: None,
            measurement: Measurement::Ranging { distance_m, std_dev },
        }
    }

    /// Combined ranging and RSSI reading.
    pub fn ranging_and_rssi(
        source: RadioSource,
        position: Point,
        distance_m: f64,
        rssi_dbm: f64,
    ) -> Self {
        Self {
            source,
            position,
            position_covariance: None,
            measurement: Measurement::RangingAndRssi {
                distance_m,
                distance_std_dev: None,
                rssi_dbm,
                rssi_std_dev: None,
            },
        }
    }

    /// Attaches a receiver-position covariance; must be square of the
    /// position's dimension.
    pub fn with_position_covariance(mut self, covariance: DMatrix<f64>) -> Self {
        debug_assert_eq!(covariance.nrows(), self.position.dims());
        debug_assert_eq!(covariance.ncols(), self.position.dims());
        self.position_covariance = Some(covariance);
        self
    }

    pub fn source(&self) -> &RadioSource {
        &self.source
    }

    pub fn position(&self) -> &Point {
        &self.position
    }

    pub fn position_covariance(&self) -> Option<&DMatrix<f64>> {
        self.position_covariance.as_ref()
    }

    pub fn measurement(&self) -> &Measurement {
        &self.measurement
    }
}

/// Candidate or final estimate of the source parameters.
///
/// Produced once per subset trial in the robust loop; never mutated after
/// construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Solution {
    pub position: Point,
    pub tx_power_dbm: f64,
    pub path_loss_exponent: f64,
}

/// A source re-wrapped with its estimated location and radiation parameters.
///
/// Standard deviations are present only when the corresponding variance was
/// available from a fitted covariance.
#[derive(Debug, Clone)]
pub struct LocatedRadioSource {
    pub identifier: String,
    pub frequency_hz: f64,
    pub position: Point,
    pub position_covariance: Option<DMatrix<f64>>,
    pub tx_power_dbm: f64,
    pub tx_power_std_dev: Option<f64>,
    pub path_loss_exponent: f64,
    pub path_loss_std_dev: Option<f64>,
}
