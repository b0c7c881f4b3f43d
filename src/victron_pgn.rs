//! Declarative-ish PGN payload construction for the fixed Victron VE.Can
//! emission set (§4.7). Each PGN gets a dedicated builder rather than a
//! data-driven table: the original firmware's JSON-mapping approach exists
//! to let a field engineer retune scaling without a rebuild, which this
//! bridge's fixed six-PGN set does not need.

use crate::alarms::AlarmState;

pub const PGN_BATTERY_LIMITS: u16 = 0x351;
pub const PGN_SOC_SOH: u16 = 0x355;
pub const PGN_VOLTAGE_CURRENT_TEMP: u16 = 0x356;
pub const PGN_ALARMS: u16 = 0x35A;
pub const PGN_MANUFACTURER_NAME: u16 = 0x35E;
pub const PGN_BATTERY_NAME: u16 = 0x35F;
pub const PGN_KEEPALIVE: u16 = 0x305;

/// Fixed emission order for one publisher tick (§4.8 step 2).
pub const EMISSION_SET: [u16; 6] = [
    PGN_VOLTAGE_CURRENT_TEMP,
    PGN_SOC_SOH,
    PGN_BATTERY_LIMITS,
    PGN_ALARMS,
    PGN_MANUFACTURER_NAME,
    PGN_BATTERY_NAME,
];

fn encode_u16_le(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

fn encode_i16_le(value: i16) -> [u8; 2] {
    value.to_le_bytes()
}

fn scaled_u16(value: f32, scale: f32) -> u16 {
    (value / scale).round().clamp(0.0, u16::MAX as f32) as u16
}

fn scaled_i16(value: f32, scale: f32) -> i16 {
    (value / scale).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// 0x351: CVL (×0.01 V) @0, CCL (×0.1 A) @2, DCL (×0.1 A) @4, trailing zero.
pub fn encode_battery_limits(cvl_v: f32, ccl_a: f32, dcl_a: f32) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[0..2].copy_from_slice(&encode_u16_le(scaled_u16(cvl_v, 0.01)));
    payload[2..4].copy_from_slice(&encode_u16_le(scaled_u16(ccl_a, 0.1)));
    payload[4..6].copy_from_slice(&encode_u16_le(scaled_u16(dcl_a, 0.1)));
    payload
}

/// 0x355: SOC (×0.1 %) @0, SOH (×0.1 %) @2.
pub fn encode_soc_soh(soc_percent: f32, soh_percent: f32) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[0..2].copy_from_slice(&encode_u16_le(scaled_u16(soc_percent, 0.1)));
    payload[2..4].copy_from_slice(&encode_u16_le(scaled_u16(soh_percent, 0.1)));
    payload
}

/// 0x356: pack-V (×0.01, unsigned) @0, pack-I (×0.1, signed) @2, pack-T
/// (×0.1 °C, signed) @4.
pub fn encode_voltage_current_temp(pack_voltage_v: f32, pack_current_a: f32, temperature_c: f32) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[0..2].copy_from_slice(&encode_u16_le(scaled_u16(pack_voltage_v, 0.01)));
    payload[2..4].copy_from_slice(&encode_i16_le(scaled_i16(pack_current_a, 0.1)));
    payload[4..6].copy_from_slice(&encode_i16_le(scaled_i16(temperature_c, 0.1)));
    payload
}

/// 0x35A: 2-bit alarm fields (0=OK, 1=Warn, 2=Alarm). byte0 bits
/// {0:UV,1:OV,2:OT,3:LTCharge}; byte1 bits {0:Imbalance,1:Comms,2:LowSoc,3:Derate};
/// byte7 bit0 is the overall summary bit.
pub fn encode_alarms(alarms: &AlarmState) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[0] = (alarms.under_voltage as u8)
        | ((alarms.over_voltage as u8) << 2)
        | ((alarms.over_temperature as u8) << 4)
        | ((alarms.low_temp_charge as u8) << 6);
    payload[1] = (alarms.cell_imbalance as u8)
        | ((alarms.comms_error as u8) << 2)
        | ((alarms.low_soc as u8) << 4)
        | ((alarms.derate as u8) << 6);
    payload[7] = (alarms.any_active() as u8) & 0x01;
    payload
}

fn encode_name(name: &str) -> [u8; 8] {
    let mut payload = [0u8; 8];
    for (slot, byte) in payload.iter_mut().zip(name.as_bytes().iter()) {
        *slot = *byte;
    }
    payload
}

pub fn encode_manufacturer_name(name: &str) -> [u8; 8] {
    encode_name(name)
}

pub fn encode_battery_name(name: &str) -> [u8; 8] {
    encode_name(name)
}

/// 0x305 keep-alive heartbeat reply, DLC=1, payload byte always zero.
pub fn encode_keepalive() -> [u8; 1] {
    [0x00]
}

/// Decodes a 0x356 payload back into physical units, used by the P5
/// round-trip property test.
pub fn decode_voltage_current_temp(payload: &[u8; 8]) -> (f32, f32, f32) {
    let raw_v = u16::from_le_bytes([payload[0], payload[1]]);
    let raw_i = i16::from_le_bytes([payload[2], payload[3]]);
    let raw_t = i16::from_le_bytes([payload[4], payload[5]]);
    (raw_v as f32 * 0.01, raw_i as f32 * 0.1, raw_t as f32 * 0.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_voltage_current_temp_matches_documented_bytes() {
        let payload = encode_voltage_current_temp(52.00, -8.5, 25.0);
        assert_eq!(payload, [0x50, 0x14, 0xAF, 0xFF, 0xFA, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn p5_round_trip_recovers_original_values_within_one_lsb() {
        let cases = [(52.00_f32, -8.5_f32, 25.0_f32), (0.0, 0.0, -40.0), (58.4, 100.0, 60.0)];
        for (v, i, t) in cases {
            let payload = encode_voltage_current_temp(v, i, t);
            let (dv, di, dt) = decode_voltage_current_temp(&payload);
            assert!((dv - v).abs() <= 0.01);
            assert!((di - i).abs() <= 0.1);
            assert!((dt - t).abs() <= 0.1);
        }
    }

    #[test]
    fn battery_limits_layout_matches_table() {
        let payload = encode_battery_limits(58.4, 45.0, 100.0);
        assert_eq!(u16::from_le_bytes([payload[0], payload[1]]), 5840);
        assert_eq!(u16::from_le_bytes([payload[2], payload[3]]), 450);
        assert_eq!(u16::from_le_bytes([payload[4], payload[5]]), 1000);
    }

    #[test]
    fn soc_soh_scales_to_one_tenth_percent() {
        let payload = encode_soc_soh(81.5, 94.0);
        assert_eq!(u16::from_le_bytes([payload[0], payload[1]]), 815);
        assert_eq!(u16::from_le_bytes([payload[2], payload[3]]), 940);
    }

    #[test]
    fn alarm_payload_sets_summary_bit_when_any_active() {
        let mut alarms = AlarmState::default();
        assert_eq!(encode_alarms(&alarms)[7], 0);
        alarms.over_voltage = true;
        let payload = encode_alarms(&alarms);
        assert_eq!(payload[0] & 0b0000_1100, 0b0000_0100);
        assert_eq!(payload[7], 1);
    }

    #[test]
    fn name_payload_pads_with_zero_and_truncates_nothing_under_eight_bytes() {
        let payload = encode_manufacturer_name("TinyBMS");
        assert_eq!(&payload[0..7], b"TinyBMS");
        assert_eq!(payload[7], 0);
    }

    #[test]
    fn keepalive_payload_is_single_zero_byte() {
        assert_eq!(encode_keepalive(), [0x00]);
    }
}
