//! Byte-oriented full-duplex serial port: configurable baud, per-operation
//! timeout, write-then-read semantics. No framing, no CRC — that lives one
//! layer up in `bms_client`.

use crate::error::SerialError;
use std::time::Duration;

/// Production and test-double backends share this contract so the BMS
/// Client can be exercised against an in-memory double without hardware.
pub trait SerialChannel: Send {
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), SerialError>;
    fn timeout(&self) -> Duration;
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SerialError>;
    fn read_exact_timeout(&mut self, len: usize) -> Result<Vec<u8>, SerialError>;
    fn flush(&mut self) -> Result<(), SerialError>;
    /// Drain and discard anything currently buffered for read.
    fn drain_rx(&mut self);
}

/// Production backend over a real serial device via the `serialport` crate.
pub struct HardwareSerialChannel {
    port: Box<dyn serialport::SerialPort>,
    timeout: Duration,
}

impl HardwareSerialChannel {
    pub fn open(device: &str, baud: u32, default_timeout_ms: u64) -> Result<Self, SerialError> {
        let timeout = Duration::from_millis(default_timeout_ms);
        let port = serialport::new(device, baud)
            .timeout(timeout)
            .open()
            .map_err(|e| SerialError::Port(e.to_string()))?;
        Ok(HardwareSerialChannel { port, timeout })
    }
}

impl SerialChannel for HardwareSerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), SerialError> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| SerialError::Port(e.to_string()))?;
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SerialError> {
        use std::io::Write;
        self.port.write(bytes).map_err(SerialError::from)
    }

    fn read_exact_timeout(&mut self, len: usize) -> Result<Vec<u8>, SerialError> {
        use std::io::Read;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        let deadline = std::time::Instant::now() + self.timeout;
        while filled < len {
            if std::time::Instant::now() >= deadline {
                return Err(SerialError::Timeout);
            }
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => return Err(SerialError::Timeout),
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(SerialError::Timeout)
                }
                Err(e) => return Err(SerialError::from(e)),
            }
        }
        Ok(buf)
    }

    fn flush(&mut self) -> Result<(), SerialError> {
        use std::io::Write;
        self.port.flush().map_err(SerialError::from)
    }

    fn drain_rx(&mut self) {
        let pending = self.port.bytes_to_read().unwrap_or(0) as usize;
        if pending > 0 {
            use std::io::Read;
            let mut sink = vec![0u8; pending];
            let _ = self.port.read(&mut sink);
        }
    }
}

/// In-memory test double: pre-loaded response queue, recorded writes.
#[cfg(test)]
pub struct StubSerialChannel {
    pub responses: std::collections::VecDeque<Vec<u8>>,
    pub writes: Vec<Vec<u8>>,
    pub timeout: Duration,
}

#[cfg(test)]
impl StubSerialChannel {
    pub fn new() -> Self {
        StubSerialChannel {
            responses: std::collections::VecDeque::new(),
            writes: Vec::new(),
            timeout: Duration::from_millis(1000),
        }
    }

    pub fn push_response(&mut self, bytes: Vec<u8>) {
        self.responses.push_back(bytes);
    }
}

#[cfg(test)]
impl SerialChannel for StubSerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), SerialError> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize, SerialError> {
        self.writes.push(bytes.to_vec());
        Ok(bytes.len())
    }

    fn read_exact_timeout(&mut self, len: usize) -> Result<Vec<u8>, SerialError> {
        match self.responses.pop_front() {
            Some(bytes) if bytes.len() == len => Ok(bytes),
            Some(bytes) if bytes.is_empty() => Err(SerialError::Timeout),
            Some(bytes) => Ok(bytes),
            None => Err(SerialError::Timeout),
        }
    }

    fn flush(&mut self) -> Result<(), SerialError> {
        Ok(())
    }

    fn drain_rx(&mut self) {}
}
