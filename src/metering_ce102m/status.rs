//! Device status register decoding. The meter reports its health as a hex
//! bitmask; only the catalogued bits are meaningful, anything else is
//! ignored.

pub const STATUS_FLAGS: [(u32, &str, &str); 8] = [
    (3, "BatDischarged", "Battery discharged"),
    (12, "TimeSync", "Time is not synchronized"),
    (16, "PowChecksum", "Checksum of power parameters mismatch"),
    (17, "IllegalAccess", "Illegal access detected"),
    (19, "BatExpired", "Battery expired"),
    (20, "EEPROM", "EEPROM checksum mismatch"),
    (21, "DeviceParam", "Checksum of device parameters mismatch"),
    (28, "Scheduler", "Scheduler configuration has errors"),
];

/// Active fault entries for a status bitmask, in catalog order.
pub fn decode(mask: u32) -> Vec<(&'static str, &'static str)> {
    STATUS_FLAGS
        .iter()
        .filter(|(bit, _, _)| mask & (1 << bit) != 0)
        .map(|&(_, key, description)| (key, description))
        .collect()
}
