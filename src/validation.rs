//! Small validation helpers used by [`crate::config::CollectConfig::validate`].
//!
//! Gain limits follow the HackRF One front end: LNA 0-40 dB in 8 dB steps, baseband
//! VGA 0-62 dB in 2 dB steps, TX VGA 0-47 dB in 1 dB steps.

use std::ops::RangeInclusive;
use std::path::Path;

/// Receive LNA (IF) gain range in dB.
pub const RX_LNA_RANGE: RangeInclusive<u32> = 0..=40;
/// Receive LNA gain step in dB.
pub const RX_LNA_STEP: u32 = 8;
/// Receive baseband VGA gain range in dB.
pub const RX_VGA_RANGE: RangeInclusive<u32> = 0..=62;
/// Receive baseband VGA gain step in dB.
pub const RX_VGA_STEP: u32 = 2;
/// Transmit VGA gain range in dB.
pub const TX_VGA_RANGE: RangeInclusive<u32> = 0..=47;

/// Validates if a given value is within a specified numeric range.
///
/// # Arguments
///
/// * `value` - The value to validate.
/// * `range` - The inclusive range to validate against.
///
/// # Returns
///
/// * `Ok(())` if the value is within the range.
/// * `Err(&'static str)` if the value is outside the range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Validates that `value` sits on a `step` grid starting at zero.
pub fn is_on_step(value: u32, step: u32) -> Result<(), &'static str> {
    if step == 0 || value % step == 0 {
        Ok(())
    } else {
        Err("Value is not a multiple of the gain step")
    }
}

/// Validates that a number is strictly positive.
pub fn is_positive(value: u64) -> Result<(), &'static str> {
    if value > 0 {
        Ok(())
    } else {
        Err("Value must be greater than 0")
    }
}

/// Validates if a given string is not empty.
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    if !value.trim().is_empty() {
        Ok(())
    } else {
        Err("Value cannot be empty")
    }
}

/// Validates that a path points at an existing regular file.
pub fn is_existing_file(path: &Path) -> Result<(), &'static str> {
    if path.as_os_str().is_empty() {
        return Err("File path cannot be empty");
    }
    if path.is_file() {
        Ok(())
    } else {
        Err("File does not exist")
    }
}

/// Checks one receiver gain pair against the HackRF limits.
pub fn check_rx_gains(lna_db: u32, vga_db: u32) -> Result<(), String> {
    is_in_range(lna_db, RX_LNA_RANGE)
        .and_then(|_| is_on_step(lna_db, RX_LNA_STEP))
        .map_err(|e| format!("lna_db {lna_db}: {e} (0-40 dB, step 8)"))?;
    is_in_range(vga_db, RX_VGA_RANGE)
        .and_then(|_| is_on_step(vga_db, RX_VGA_STEP))
        .map_err(|e| format!("vga_db {vga_db}: {e} (0-62 dB, step 2)"))?;
    Ok(())
}

/// Checks the transmit VGA gain against the HackRF limit.
pub fn check_tx_gain(amp_db: u32) -> Result<(), String> {
    is_in_range(amp_db, TX_VGA_RANGE).map_err(|e| format!("amp_db {amp_db}: {e} (0-47 dB)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_gain_grid() {
        assert!(check_rx_gains(8, 8).is_ok());
        assert!(check_rx_gains(40, 62).is_ok());
        assert!(check_rx_gains(42, 42).is_err());
        assert!(check_rx_gains(16, 63).is_err());
        assert!(check_rx_gains(16, 15).is_err());
    }

    #[test]
    fn tx_gain_limit() {
        assert!(check_tx_gain(0).is_ok());
        assert!(check_tx_gain(47).is_ok());
        assert!(check_tx_gain(48).is_err());
    }

    #[test]
    fn basic_helpers() {
        assert!(is_positive(1).is_ok());
        assert!(is_positive(0).is_err());
        assert!(is_not_empty("abc").is_ok());
        assert!(is_not_empty("  ").is_err());
        assert!(is_existing_file(Path::new("")).is_err());
        assert!(is_existing_file(Path::new("/definitely/not/here.iq")).is_err());
    }
}
