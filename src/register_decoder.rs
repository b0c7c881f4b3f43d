//! Maps raw 16-bit register words, fetched per the read schedule of §6.3,
//! onto a strongly-typed `LiveSnapshot` via a declarative binding table.

use crate::live_data::LiveSnapshot;
use std::collections::BTreeMap;

/// Fixed blocks fetched every successful polling round: (address, word count).
/// Missing any block discards the whole round.
pub const READ_SCHEDULE: &[(u16, u8)] = &[
    (32, 21),
    (102, 2),
    (113, 2),
    (305, 3),
    (315, 5),
    (500, 6),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    U16,
    I16,
    U32,
    LowByte,
    HighByte,
}

#[derive(Debug, Clone, Copy)]
pub enum Destination {
    PackVoltageV,
    PackCurrentA,
    SocPercent,
    SohPercent,
    TemperatureC,
    MinCellMv,
    MaxCellMv,
    BalancingBits,
    OnlineStatus,
    MaxChargeCurrentA,
    MaxDischargeCurrentA,
    CellOvervoltageMv,
    CellUndervoltageMv,
    DischargeOvercurrentA,
    ChargeOvercurrentA,
    PackTempMinC,
    PackTempMaxC,
    OverheatCutoffC,
    LifetimeSecondsLo,
    LifetimeSecondsHi,
}

pub struct Binding {
    pub addr: u16,
    pub wire_type: WireType,
    pub scale: f32,
    pub destination: Destination,
    pub label: &'static str,
}

/// Canonical TinyBMS register binding table (§4.5). Scale is the multiplier
/// applied to the raw integer to produce the snapshot's physical unit.
pub const BINDINGS: &[Binding] = &[
    Binding { addr: 32, wire_type: WireType::U32, scale: 0.01, destination: Destination::PackVoltageV, label: "Pack voltage, V" },
    Binding { addr: 36, wire_type: WireType::I16, scale: 0.1, destination: Destination::PackCurrentA, label: "Pack current, A" },
    Binding { addr: 38, wire_type: WireType::U16, scale: 0.1, destination: Destination::SocPercent, label: "SOC, %" },
    Binding { addr: 40, wire_type: WireType::U16, scale: 0.1, destination: Destination::SohPercent, label: "SOH, %" },
    Binding { addr: 41, wire_type: WireType::I16, scale: 0.1, destination: Destination::TemperatureC, label: "Internal temperature, C" },
    Binding { addr: 42, wire_type: WireType::U16, scale: 1.0, destination: Destination::MinCellMv, label: "Min cell, mV" },
    Binding { addr: 43, wire_type: WireType::U16, scale: 1.0, destination: Destination::MaxCellMv, label: "Max cell, mV" },
    Binding { addr: 45, wire_type: WireType::U16, scale: 1.0, destination: Destination::BalancingBits, label: "Balancing bitmap" },
    Binding { addr: 46, wire_type: WireType::LowByte, scale: 1.0, destination: Destination::OnlineStatus, label: "BMS status code" },
    Binding { addr: 48, wire_type: WireType::U16, scale: 0.1, destination: Destination::MaxChargeCurrentA, label: "Advertised max charge, A" },
    Binding { addr: 50, wire_type: WireType::U16, scale: 0.1, destination: Destination::MaxDischargeCurrentA, label: "Advertised max discharge, A" },
    Binding { addr: 51, wire_type: WireType::U16, scale: 1.0, destination: Destination::CellOvervoltageMv, label: "Cell overvoltage threshold, mV" },
    Binding { addr: 52, wire_type: WireType::U16, scale: 1.0, destination: Destination::CellUndervoltageMv, label: "Cell undervoltage threshold, mV" },
    Binding { addr: 102, wire_type: WireType::U16, scale: 0.1, destination: Destination::DischargeOvercurrentA, label: "Discharge overcurrent threshold, A" },
    Binding { addr: 103, wire_type: WireType::U16, scale: 0.1, destination: Destination::ChargeOvercurrentA, label: "Charge overcurrent threshold, A" },
    Binding { addr: 113, wire_type: WireType::LowByte, scale: 0.1, destination: Destination::PackTempMinC, label: "Min cell temperature, C" },
    Binding { addr: 113, wire_type: WireType::HighByte, scale: 0.1, destination: Destination::PackTempMaxC, label: "Max cell temperature, C" },
    Binding { addr: 305, wire_type: WireType::U16, scale: 0.1, destination: Destination::OverheatCutoffC, label: "Overheat cutoff, C" },
    Binding { addr: 315, wire_type: WireType::U16, scale: 1.0, destination: Destination::LifetimeSecondsLo, label: "Runtime counter lo" },
    Binding { addr: 316, wire_type: WireType::U16, scale: 1.0, destination: Destination::LifetimeSecondsHi, label: "Runtime counter hi" },
];

/// Raw per-round register words, flattened into an address-indexed map by
/// the caller after fetching every block in `READ_SCHEDULE`.
pub type RegisterWords = BTreeMap<u16, u16>;

pub fn words_map_from_blocks(blocks: &[((u16, u8), Vec<u16>)]) -> Option<RegisterWords> {
    let mut map = RegisterWords::new();
    for ((start_addr, word_count), words) in blocks {
        if words.len() != *word_count as usize {
            return None;
        }
        for (i, word) in words.iter().enumerate() {
            map.insert(start_addr + i as u16, *word);
        }
    }
    Some(map)
}

fn has_words(map: &RegisterWords, addr: u16, count: u16) -> bool {
    (0..count).all(|i| map.contains_key(&(addr + i)))
}

/// Decodes every binding whose full word range is present in `map` and
/// applies it to `snapshot`. Firmware/manufacturer strings and the
/// composed lifetime counter are handled separately by the caller since
/// they are not single-field linear bindings.
fn apply_binding(binding: &Binding, map: &RegisterWords, snapshot: &mut LiveSnapshot) {
    let raw: i64 = match binding.wire_type {
        WireType::U32 => {
            if !has_words(map, binding.addr, 2) {
                return;
            }
            let lo = map[&binding.addr] as u32;
            let hi = map[&(binding.addr + 1)] as u32;
            ((hi << 16) | lo) as i64
        }
        WireType::I16 => {
            if !has_words(map, binding.addr, 1) {
                return;
            }
            map[&binding.addr] as i16 as i64
        }
        WireType::U16 => {
            if !has_words(map, binding.addr, 1) {
                return;
            }
            map[&binding.addr] as i64
        }
        WireType::LowByte => {
            if !has_words(map, binding.addr, 1) {
                return;
            }
            (map[&binding.addr] & 0xFF) as i64
        }
        WireType::HighByte => {
            if !has_words(map, binding.addr, 1) {
                return;
            }
            ((map[&binding.addr] >> 8) & 0xFF) as i64
        }
    };

    let scaled = raw as f32 * binding.scale;

    match binding.destination {
        Destination::PackVoltageV => snapshot.pack_voltage_v = scaled,
        Destination::PackCurrentA => snapshot.pack_current_a = scaled,
        Destination::SocPercent => snapshot.soc_percent = scaled,
        Destination::SohPercent => snapshot.soh_percent = scaled,
        Destination::TemperatureC => snapshot.temperature_c = scaled,
        Destination::MinCellMv => snapshot.min_cell_mv = raw as u16,
        Destination::MaxCellMv => snapshot.max_cell_mv = raw as u16,
        Destination::BalancingBits => snapshot.balancing_bits = raw as u16,
        Destination::OnlineStatus => snapshot.online_status = raw as u8,
        Destination::MaxChargeCurrentA => snapshot.max_charge_current_a = scaled,
        Destination::MaxDischargeCurrentA => snapshot.max_discharge_current_a = scaled,
        Destination::CellOvervoltageMv => snapshot.cell_overvoltage_mv = raw as u16,
        Destination::CellUndervoltageMv => snapshot.cell_undervoltage_mv = raw as u16,
        Destination::DischargeOvercurrentA => snapshot.discharge_overcurrent_a = scaled,
        Destination::ChargeOvercurrentA => snapshot.charge_overcurrent_a = scaled,
        Destination::PackTempMinC => snapshot.pack_temp_min_c = scaled,
        Destination::PackTempMaxC => snapshot.pack_temp_max_c = scaled,
        Destination::OverheatCutoffC => snapshot.overheat_cutoff_c = scaled,
        Destination::LifetimeSecondsLo => {
            snapshot.lifetime_seconds = (snapshot.lifetime_seconds & 0xFFFF0000) | (raw as u32);
        }
        Destination::LifetimeSecondsHi => {
            snapshot.lifetime_seconds =
                (snapshot.lifetime_seconds & 0x0000FFFF) | ((raw as u32) << 16);
        }
    }
}

/// Decodes `"<word0>.<word1>"` at the documented firmware-version address.
fn decode_firmware_version(map: &RegisterWords, addr: u16) -> Option<String> {
    if !has_words(map, addr, 2) {
        return None;
    }
    Some(format!("{}.{}", map[&addr], map[&(addr + 1)]))
}

/// Decodes the manufacturer/family string block: high then low byte of each
/// word, in order, stopping at the first NUL.
fn decode_ascii_block(map: &RegisterWords, addr: u16, word_count: u16) -> Option<String> {
    if !has_words(map, addr, word_count) {
        return None;
    }
    let mut bytes = Vec::with_capacity(word_count as usize * 2);
    for i in 0..word_count {
        let word = map[&(addr + i)];
        bytes.push((word >> 8) as u8);
        bytes.push((word & 0xFF) as u8);
    }
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Decodes a full polling round. Returns `None` if the round's word map is
/// incomplete for any scheduled block (the caller is expected to have
/// already validated block completeness via `words_map_from_blocks`).
pub fn decode_snapshot(map: &RegisterWords) -> LiveSnapshot {
    let mut snapshot = LiveSnapshot::default();
    for binding in BINDINGS {
        apply_binding(binding, map, &mut snapshot);
    }
    if let Some(version) = decode_firmware_version(map, 306) {
        snapshot.firmware_version = version;
    }
    if let Some(family) = decode_ascii_block(map, 500, 6) {
        snapshot.manufacturer_family = family;
    }
    snapshot.finalize();
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(addr: u16, words: &[u16]) -> ((u16, u8), Vec<u16>) {
        ((addr, words.len() as u8), words.to_vec())
    }

    fn full_round() -> RegisterWords {
        let blocks = vec![
            block(32, &{
                let mut w = vec![0u16; 21];
                // pack_voltage_v u32 @32/33 = 5200 (0x1450) -> 52.00V
                w[0] = 0x1450;
                w[1] = 0x0000;
                // pack_current_a i16 @36 = -85 -> -8.5A
                w[4] = 0xFFAFu16; // index 4 = addr 36
                // soc @38 idx6 = 815 -> 81.5
                w[6] = 815;
                // soh @40 idx8 = 940 -> 94.0
                w[8] = 940;
                // temp @41 idx9 = 250 -> 25.0C
                w[9] = 250;
                // min_cell @42 idx10
                w[10] = 3100;
                // max_cell @43 idx11
                w[11] = 3275;
                // balancing @45 idx13
                w[13] = 0;
                // online_status @46 idx14 low byte
                w[14] = 0x0091;
                // max charge @48 idx16 = 450 -> 45.0
                w[16] = 450;
                // max discharge @50 idx18 = 1000 -> 100.0
                w[18] = 1000;
                // cell OV @51 idx19
                w[19] = 3650;
                // cell UV @52 idx20
                w[20] = 2800;
                w
            }),
            block(102, &[500, 500]), // discharge/charge overcurrent *0.1 -> 50.0A
            block(113, &[250, 0x1901]), // lo=25.0C min, hi byte=0x19=25 -> 2.5C (scale .1)
            block(305, &[550, 0, 0]), // overheat cutoff 55.0C
            block(315, &[100, 0, 0, 0, 0]),
            block(500, &[
                (b'T' as u16) << 8 | b'i' as u16,
                (b'n' as u16) << 8 | b'y' as u16,
                0,
                0,
                0,
                0,
            ]),
        ];
        words_map_from_blocks(&blocks).unwrap()
    }

    #[test]
    fn decodes_s1_scenario_fields() {
        let map = full_round();
        let snap = decode_snapshot(&map);
        assert!((snap.pack_voltage_v - 52.00).abs() < 1e-4);
        assert!((snap.pack_current_a - (-8.5)).abs() < 1e-4);
        assert!((snap.soc_percent - 81.5).abs() < 1e-4);
        assert!((snap.soh_percent - 94.0).abs() < 1e-4);
        assert_eq!(snap.min_cell_mv, 3100);
        assert_eq!(snap.max_cell_mv, 3275);
        assert_eq!(snap.cell_imbalance_mv, 175);
        assert_eq!(snap.online_status, 0x91);
    }

    #[test]
    fn u32_composition_is_little_endian_word_order() {
        // P1: u32 binding across (w_lo, w_hi) yields (w_hi<<16)|w_lo
        let blocks = vec![block(32, &{
            let mut w = vec![0u16; 21];
            w[0] = 0x0002; // lo
            w[1] = 0x0001; // hi
            w
        })];
        let map = words_map_from_blocks(&blocks).unwrap();
        let snap = decode_snapshot(&map);
        // raw = (1<<16)|2 = 65538, *0.01 = 655.38
        assert!((snap.pack_voltage_v - 655.38).abs() < 1e-2);
    }

    #[test]
    fn signed_16_bit_reinterprets_twos_complement() {
        let blocks = vec![block(32, &{
            let mut w = vec![0u16; 21];
            w[4] = 0xFFFFu16; // -1 raw at addr 36
            w
        })];
        let map = words_map_from_blocks(&blocks).unwrap();
        let snap = decode_snapshot(&map);
        assert!((snap.pack_current_a - (-0.1)).abs() < 1e-4);
    }

    #[test]
    fn incomplete_block_discards_whole_round() {
        let blocks = vec![block(32, &vec![0u16; 20])]; // one short
        assert!(words_map_from_blocks(&blocks).is_none());
    }
}
