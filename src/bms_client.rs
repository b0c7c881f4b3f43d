//! Framed request/response protocol over the Serial Channel: build frame,
//! transmit, await reply, validate CRC/protocol, decode. Ported from the
//! `performTransaction` retry/timeout harness of the reference UART client.

use crate::bms_protocol::{self, CMD_ACK, CMD_NACK, PREAMBLE};
use crate::error::BmsClientError;
use crate::serial_channel::SerialChannel;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionCounters {
    pub retries: u32,
    pub timeouts: u32,
    pub crc_errors: u32,
    pub write_errors: u32,
}

pub struct BmsClient<'a> {
    serial: &'a mut dyn SerialChannel,
    attempt_count: u8,
    retry_delay: Duration,
    transaction_timeout: Duration,
}

impl<'a> BmsClient<'a> {
    pub fn new(
        serial: &'a mut dyn SerialChannel,
        attempt_count: u8,
        retry_delay_ms: u32,
        transaction_timeout_ms: u64,
    ) -> Self {
        BmsClient {
            serial,
            attempt_count: attempt_count.max(1),
            retry_delay: Duration::from_millis(retry_delay_ms as u64),
            transaction_timeout: Duration::from_millis(transaction_timeout_ms),
        }
    }

    /// Reads `word_count` contiguous registers starting at `start_addr`.
    pub fn read_register_block(
        &mut self,
        start_addr: u16,
        word_count: u8,
    ) -> Result<(Vec<u16>, TransactionCounters), BmsClientError> {
        let request = bms_protocol::build_read_block_request(start_addr, word_count);
        let expected_len = 3 + word_count as usize * 2 + 2;
        let (reply, counters) = self.perform_transaction(&request, expected_len)?;
        self.validate_read_reply(&reply, bms_protocol::CMD_READ_BLOCK, word_count as usize * 2)?;
        let words = bms_protocol::words_from_bytes(&reply[3..3 + word_count as usize * 2]);
        Ok((words, counters))
    }

    /// Reads an explicit, possibly non-contiguous, list of registers.
    pub fn read_register_list(
        &mut self,
        addresses: &[u16],
    ) -> Result<(Vec<u16>, TransactionCounters), BmsClientError> {
        let request = bms_protocol::build_read_list_request(addresses);
        let expected_len = 3 + addresses.len() * 2 + 2;
        let (reply, counters) = self.perform_transaction(&request, expected_len)?;
        self.validate_read_reply(&reply, bms_protocol::CMD_READ_LIST, addresses.len() * 2)?;
        let words = bms_protocol::words_from_bytes(&reply[3..3 + addresses.len() * 2]);
        Ok((words, counters))
    }

    pub fn write_register_block(
        &mut self,
        start_addr: u16,
        values: &[u16],
    ) -> Result<TransactionCounters, BmsClientError> {
        let request = bms_protocol::build_write_block_request(start_addr, values);
        let (reply, counters) = self.perform_transaction(&request, 5)?;
        self.validate_write_reply(&reply)?;
        Ok(counters)
    }

    pub fn write_register_list(
        &mut self,
        pairs: &[(u16, u16)],
    ) -> Result<TransactionCounters, BmsClientError> {
        let request = bms_protocol::build_write_list_request(pairs);
        let (reply, counters) = self.perform_transaction(&request, 5)?;
        self.validate_write_reply(&reply)?;
        Ok(counters)
    }

    fn validate_read_reply(
        &self,
        reply: &[u8],
        expected_cmd: u8,
        data_len: usize,
    ) -> Result<(), BmsClientError> {
        if reply[0] != PREAMBLE || reply[1] != expected_cmd {
            return Err(BmsClientError::Protocol("unexpected preamble/command".into()));
        }
        if reply[2] as usize != data_len {
            return Err(BmsClientError::Protocol("byte-count mismatch".into()));
        }
        Ok(())
    }

    fn validate_write_reply(&self, reply: &[u8]) -> Result<(), BmsClientError> {
        if reply[0] != PREAMBLE {
            return Err(BmsClientError::Protocol("unexpected preamble".into()));
        }
        match reply[1] {
            CMD_ACK => Ok(()),
            CMD_NACK => Err(BmsClientError::Nack(reply[2])),
            _ => Err(BmsClientError::Protocol("unexpected reply command".into())),
        }
    }

    /// Acquires the transaction-scoped channel timeout, runs the attempt
    /// loop, and restores whatever timeout the channel had before — on every
    /// exit path, success or failure alike.
    fn perform_transaction(
        &mut self,
        request: &[u8],
        expected_reply_len: usize,
    ) -> Result<(Vec<u8>, TransactionCounters), BmsClientError> {
        let previous_timeout = self.serial.timeout();
        self.serial
            .set_timeout(self.transaction_timeout)
            .map_err(|e| BmsClientError::Write(e.to_string()))?;

        let result = self.perform_transaction_attempts(request, expected_reply_len);

        let _ = self.serial.set_timeout(previous_timeout);
        result
    }

    fn perform_transaction_attempts(
        &mut self,
        request: &[u8],
        expected_reply_len: usize,
    ) -> Result<(Vec<u8>, TransactionCounters), BmsClientError> {
        let mut counters = TransactionCounters::default();
        let mut last_err = BmsClientError::Timeout;

        for attempt in 0..self.attempt_count {
            if attempt > 0 {
                counters.retries += 1;
                std::thread::sleep(self.retry_delay);
            }

            self.serial.drain_rx();

            match self.serial.write(request) {
                Ok(n) if n == request.len() => {}
                Ok(_) => {
                    counters.write_errors += 1;
                    last_err = BmsClientError::Write("partial write".into());
                    continue;
                }
                Err(e) => {
                    counters.write_errors += 1;
                    last_err = BmsClientError::Write(e.to_string());
                    continue;
                }
            }

            let reply = match self.serial.read_exact_timeout(expected_reply_len) {
                Ok(bytes) => bytes,
                Err(_) => {
                    counters.timeouts += 1;
                    last_err = BmsClientError::Timeout;
                    continue;
                }
            };

            if !bms_protocol::verify_crc(&reply) {
                counters.crc_errors += 1;
                last_err = BmsClientError::CrcMismatch;
                continue;
            }

            return Ok((reply, counters));
        }

        Err(last_err)
    }
}
