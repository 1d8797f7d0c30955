//! ProFile commands relayed from the Apple by PRU 1.
//!
//! A command is six bytes: operation, 24-bit big-endian block address,
//! retry count, and sparing threshold.

use std::fmt;

/// Length of an encoded command in bytes.
pub const COMMAND_LEN: usize = 6;

/// ProFile operations the emulator serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// 0: Read a block
    Read = 0x00,
    /// 1: Write a block
    Write = 0x01,
    /// 2: Write a block and verify
    WriteVerify = 0x02,
    /// 3: Write a block, forcing sparing
    WriteForceSpare = 0x03,
}

impl Operation {
    /// All write variants are handled identically.
    pub fn is_write(self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl TryFrom<u8> for Operation {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Read),
            0x01 => Ok(Self::Write),
            0x02 => Ok(Self::WriteVerify),
            0x03 => Ok(Self::WriteForceSpare),
            _ => Err(value),
        }
    }
}

/// Reserved ("magic") block addresses.
pub mod addr {
    use std::ops::Range;

    /// Spare table (read only)
    pub const SPARE_TABLE: u32 = 0xFFFFFF;
    /// Last sector read or written (read only)
    pub const LAST_BUFFER: u32 = 0xFFFFFE;
    /// Session conclusion (write with the magic parameters below)
    pub const CONCLUSION: u32 = 0xFFFFFD;
    /// Retry count that marks a conclusion write
    pub const CONCLUSION_RETRY_COUNT: u8 = 0xFE;
    /// Sparing threshold that marks a conclusion write
    pub const CONCLUSION_SPARING_THRESHOLD: u8 = 0xAF;
    /// Blocks that extensions may claim
    pub const EXTENSIONS: Range<u32> = 0xFF0000..0xFFFF00;
}

/// Why six bytes did not decode to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer than six bytes arrived.
    Truncated(usize),
    /// Operation byte is not one we serve.
    UnknownOperation(u8),
}

/// A decoded ProFile command. Constructed per request, never retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub operation: Operation,
    pub address: u32,
    pub retry_count: u8,
    pub sparing_threshold: u8,
}

impl Command {
    /// Decode a command from the bytes PRU 1 relayed.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let raw: &[u8; COMMAND_LEN] = raw
            .try_into()
            .map_err(|_| DecodeError::Truncated(raw.len()))?;
        let operation = Operation::try_from(raw[0]).map_err(DecodeError::UnknownOperation)?;

        Ok(Self {
            operation,
            address: u32::from_be_bytes([0, raw[1], raw[2], raw[3]]),
            retry_count: raw[4],
            sparing_threshold: raw[5],
        })
    }

    /// Encode back to wire format.
    pub fn encode(&self) -> [u8; COMMAND_LEN] {
        let address = self.address.to_be_bytes();
        [
            self.operation as u8,
            address[1],
            address[2],
            address[3],
            self.retry_count,
            self.sparing_threshold,
        ]
    }

    /// Retry count and sparing threshold as one big-endian 16-bit word.
    /// Extensions use it as a parameter.
    pub fn parameter_word(&self) -> u16 {
        u16::from_be_bytes([self.retry_count, self.sparing_threshold])
    }

    /// Whether this is the write that ends the emulation session.
    pub fn is_conclusion(&self) -> bool {
        self.operation.is_write()
            && self.address == addr::CONCLUSION
            && self.retry_count == addr::CONCLUSION_RETRY_COUNT
            && self.sparing_threshold == addr::CONCLUSION_SPARING_THRESHOLD
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.operation.is_write() {
            "Write"
        } else {
            " Read"
        };
        write!(f, "{} sector ${:06X}", verb, self.address)
    }
}

/// Lowercase hex rendering of raw command bytes, for logging.
pub fn hex(raw: &[u8]) -> String {
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_read() {
        let command = Command::decode(&[0x00, 0x01, 0x23, 0x45, 0x0A, 0x03]).unwrap();
        assert_eq!(command.operation, Operation::Read);
        assert_eq!(command.address, 0x012345);
        assert_eq!(command.retry_count, 0x0A);
        assert_eq!(command.sparing_threshold, 0x03);
        assert_eq!(command.parameter_word(), 0x0A03);
    }

    #[test]
    fn test_decode_write_variants() {
        for (op, expected) in [
            (0x01, Operation::Write),
            (0x02, Operation::WriteVerify),
            (0x03, Operation::WriteForceSpare),
        ] {
            let command = Command::decode(&[op, 0, 0, 1, 0, 0]).unwrap();
            assert_eq!(command.operation, expected);
            assert!(command.operation.is_write());
        }
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            Command::decode(&[0x00, 0x00, 0x00]),
            Err(DecodeError::Truncated(3))
        );
        assert_eq!(
            Command::decode(&[0x04, 0x00, 0x00, 0x00, 0x00, 0x00]),
            Err(DecodeError::UnknownOperation(0x04))
        );
    }

    #[test]
    fn test_encode_matches_wire_layout() {
        let command = Command {
            operation: Operation::WriteVerify,
            address: 0xFFFEFF,
            retry_count: 0x12,
            sparing_threshold: 0x34,
        };
        assert_eq!(command.encode(), [0x02, 0xFF, 0xFE, 0xFF, 0x12, 0x34]);
    }

    #[test]
    fn test_conclusion_needs_magic_parameters() {
        let mut command = Command {
            operation: Operation::Write,
            address: addr::CONCLUSION,
            retry_count: 0xFE,
            sparing_threshold: 0xAF,
        };
        assert!(command.is_conclusion());

        command.sparing_threshold = 0xAE;
        assert!(!command.is_conclusion());

        command.sparing_threshold = 0xAF;
        command.operation = Operation::Read;
        assert!(!command.is_conclusion());
    }

    #[test]
    fn test_display_and_hex() {
        let raw = [0x00, 0x00, 0x12, 0x34, 0x0A, 0x03];
        let command = Command::decode(&raw).unwrap();
        assert_eq!(command.to_string(), " Read sector $001234");
        assert_eq!(hex(&raw), "000012340a03");
    }

    #[test]
    fn test_extension_range_excludes_native_blocks() {
        for address in [addr::SPARE_TABLE, addr::LAST_BUFFER, addr::CONCLUSION] {
            assert!(!addr::EXTENSIONS.contains(&address));
        }
        assert!(addr::EXTENSIONS.contains(&0xFFFEFF));
        assert!(addr::EXTENSIONS.contains(&0xFF0000));
    }
}
