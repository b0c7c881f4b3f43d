//! TinyBMS native wire framing: preamble/command constants and the Modbus
//! CRC16 used to validate every frame.

pub const PREAMBLE: u8 = 0xAA;
pub const CMD_READ_BLOCK: u8 = 0x07;
pub const CMD_READ_LIST: u8 = 0x09;
pub const CMD_WRITE_BLOCK: u8 = 0x0B;
pub const CMD_WRITE_LIST: u8 = 0x0D;
pub const CMD_ACK: u8 = 0x01;
pub const CMD_NACK: u8 = 0x81;
pub const MAX_FRAME_SIZE: usize = 256;

/// Modbus CRC16 (poly 0xA001 reflected, init 0xFFFF). Appended little-endian
/// on the wire.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16_modbus(frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
}

/// Validate the trailing two CRC bytes of `frame` against the preceding
/// content. `frame` must include the CRC bytes.
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    let expected = crc16_modbus(body);
    trailer[0] == (expected & 0xFF) as u8 && trailer[1] == (expected >> 8) as u8
}

pub fn build_read_block_request(start_addr: u16, word_count: u8) -> Vec<u8> {
    let mut frame = vec![
        PREAMBLE,
        CMD_READ_BLOCK,
        word_count,
        (start_addr & 0xFF) as u8,
        (start_addr >> 8) as u8,
    ];
    append_crc(&mut frame);
    frame
}

pub fn build_read_list_request(addresses: &[u16]) -> Vec<u8> {
    let mut frame = vec![PREAMBLE, CMD_READ_LIST, addresses.len() as u8];
    for addr in addresses {
        frame.push((addr & 0xFF) as u8);
        frame.push((addr >> 8) as u8);
    }
    append_crc(&mut frame);
    frame
}

pub fn build_write_block_request(start_addr: u16, values: &[u16]) -> Vec<u8> {
    let mut frame = vec![
        PREAMBLE,
        CMD_WRITE_BLOCK,
        values.len() as u8,
        (start_addr & 0xFF) as u8,
        (start_addr >> 8) as u8,
    ];
    for v in values {
        frame.push((v & 0xFF) as u8);
        frame.push((v >> 8) as u8);
    }
    append_crc(&mut frame);
    frame
}

pub fn build_write_list_request(pairs: &[(u16, u16)]) -> Vec<u8> {
    let mut frame = vec![PREAMBLE, CMD_WRITE_LIST, pairs.len() as u8];
    for (addr, value) in pairs {
        frame.push((addr & 0xFF) as u8);
        frame.push((addr >> 8) as u8);
        frame.push((value & 0xFF) as u8);
        frame.push((value >> 8) as u8);
    }
    append_crc(&mut frame);
    frame
}

/// Decode a little-endian `u16` word array from the data payload of a
/// `CMD_READ_BLOCK`/`CMD_READ_LIST` reply.
pub fn words_from_bytes(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_round_trip_holds_for_arbitrary_bytes() {
        for seed in 0u8..=255 {
            let body = vec![seed, seed.wrapping_mul(7), 0x42, seed.wrapping_add(3)];
            let mut framed = body.clone();
            append_crc(&mut framed);
            assert!(verify_crc(&framed));
            // P6: crc16(b ++ le16(crc16(b))) == 0
            assert_eq!(crc16_modbus(&framed), 0);
        }
    }

    #[test]
    fn read_block_request_matches_wire_layout() {
        let frame = build_read_block_request(32, 21);
        assert_eq!(frame[0], PREAMBLE);
        assert_eq!(frame[1], CMD_READ_BLOCK);
        assert_eq!(frame[2], 21);
        assert_eq!(u16::from_le_bytes([frame[3], frame[4]]), 32);
        assert_eq!(frame.len(), 7);
        assert!(verify_crc(&frame));
    }

    #[test]
    fn words_from_bytes_is_little_endian() {
        let words = words_from_bytes(&[0x50, 0x14, 0x00, 0x00]);
        assert_eq!(words, vec![0x1450, 0x0000]);
    }
}
