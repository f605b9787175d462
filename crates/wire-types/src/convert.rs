//! Raw sensor field conversions. Single source of truth for the scale
//! constants used by the log lines and output files.

const TEMP_SCALE: f64 = 0.4185;
const TEMP_OFFSET_F: f64 = 32.0;
const BATTERY_SCALE: f32 = 51.2;

/// Raw battery byte to volts.
pub fn battery_to_volts(raw: u8) -> f32 {
    f32::from(raw) / BATTERY_SCALE
}

/// Raw temperature word to degrees Fahrenheit. `clip_negative` follows the
/// `sensor.clip_negative_temperatures` config key.
pub fn temperature_to_fahrenheit(raw: u16, clip_negative: bool) -> f64 {
    let value = f64::from(raw) * TEMP_SCALE * 9.0 / 5.0 + TEMP_OFFSET_F;
    if clip_negative && value < 0.0 {
        0.0
    } else {
        value
    }
}
