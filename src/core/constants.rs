//! Physical constants, defaults, and unit conversions.

use crate::error::EstimationError;

/// Speed of light in vacuum (m/s).
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Path-loss exponent of free space, used when no initial value is given.
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.0;

/// Standard deviation assumed for RSSI readings that carry none (dB).
pub const DEFAULT_RSSI_STD_DEV: f64 = 1.0;

/// Standard deviation assumed for ranging readings that carry none (m).
pub const DEFAULT_RANGING_STD_DEV: f64 = 1.0;

/// Converts a power in dBm to milliwatts: `P(mW) = 10^(dBm/10)`.
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Converts a power in milliwatts to dBm: `dBm = 10*log10(mW)`.
///
/// Fails for non-positive inputs, which have no dBm representation.
pub fn mw_to_dbm(mw: f64) -> Result<f64, EstimationError> {
    if mw <= 0.0 || !mw.is_finite() {
        return Err(EstimationError::InvalidArgument(format!(
            "power must be a positive number of milliwatts, got {mw}"
        )));
    }
    Ok(10.0 * mw.log10())
}
