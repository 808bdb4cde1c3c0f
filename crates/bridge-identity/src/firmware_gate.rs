//! The firmware-gate table: which device families are eligible for salted
//! (CQ) remote-id derivation, and from which firmware version onward.

/// True iff `device_type`/`family` at `version` is eligible for salted
/// derivation. A handful of entries are matched on the exact `device_type`
/// rather than the family, per the table.
pub fn salted_derivation_eligible(device_type: &str, family: &str, version: f64) -> bool {
    match device_type {
        "HME-2" | "HME-4" | "TPM-CN" => return version >= 122.0,
        "HME-3" | "HME-5" => return version >= 120.0,
        _ => {}
    }

    match family {
        "JPLS" | "HMM" | "HMN" => version >= 136.0,
        "HMB" | "HMA" | "HMK" | "HMF" => version >= 230.0,
        "HMJ" => version >= 116.0,
        "HMI" => version >= 126.0,
        "HMG" => version >= 154.0,
        "VNSE3" => true,
        _ => false,
    }
}
