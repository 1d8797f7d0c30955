//! Sector transfers between the emulator and PRU 1's drive buffer.
//!
//! An RPMsg message cannot hold a whole sector, so transfers are split:
//! fetches (the Apple's write data) come back in two 266-byte halves, and
//! deliveries (data for the Apple to read) go out parity-interleaved in
//! three chunks. Every request starts with a statistically unusual 4-byte
//! magic number followed by a little-endian offset and length.

use std::time::Duration;

use crate::channel::Channel;
use crate::error::{AphidError, AphidResult};
use crate::store::{Sector, SECTOR_SIZE};

const MAGIC_FETCH: [u8; 4] = [0x8C, 0xA9, 0x37, 0xF1];
const MAGIC_DELIVER: [u8; 4] = [0xDB, 0x95, 0x4B, 0xC7];
const MAGIC_RESUME: [u8; 4] = [0xA6, 0x93, 0x73, 0xEA];

/// Length of every request header.
pub const HEADER_LEN: usize = 8;

/// Bytes fetched per half-sector request.
pub const FETCH_HALF: usize = SECTOR_SIZE / 2;

/// (offset, length) of each delivery chunk over the parity-doubled payload.
pub const DELIVER_CHUNKS: [(usize, usize); 3] = [(0, 354), (354, 354), (708, 356)];

const _: () = assert!(
    DELIVER_CHUNKS[2].0 + DELIVER_CHUNKS[2].1 == 2 * SECTOR_SIZE,
    "delivery chunks must cover exactly one parity-doubled sector"
);
const _: () = assert!(2 * FETCH_HALF == SECTOR_SIZE);

const fn header(magic: [u8; 4], offset: usize, length: usize) -> [u8; HEADER_LEN] {
    let offset = (offset as u16).to_le_bytes();
    let length = (length as u16).to_le_bytes();
    [
        magic[0], magic[1], magic[2], magic[3], offset[0], offset[1], length[0], length[1],
    ]
}

/// Ask for the first half of PRU 1's sector buffer.
pub const FETCH_PART_1: [u8; HEADER_LEN] = header(MAGIC_FETCH, 0, FETCH_HALF);
/// Ask for the second half of PRU 1's sector buffer.
pub const FETCH_PART_2: [u8; HEADER_LEN] = header(MAGIC_FETCH, FETCH_HALF, FETCH_HALF);
/// Tell PRU 1 that buffer activity is over and it may carry on.
pub const RESUME: [u8; HEADER_LEN] = header(MAGIC_RESUME, 0, 0);

/// Parity byte for each data byte: `0x00` for an even number of set bits,
/// `0xFF` for an odd number.
pub const PARITY: [u8; 256] = parity_table();

const fn parity_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = if (i as u8).count_ones() % 2 == 0 { 0x00 } else { 0xFF };
        i += 1;
    }
    table
}

/// Interleave a parity byte after every data byte.
pub fn with_parity(data: &Sector) -> Vec<u8> {
    data.iter().flat_map(|&b| [b, PARITY[b as usize]]).collect()
}

/// Download PRU 1's sector buffer (the data the Apple is writing).
pub fn fetch_sector<C: Channel + ?Sized>(
    channel: &mut C,
    timeout: Option<Duration>,
) -> AphidResult<Sector> {
    channel.write(&FETCH_PART_1, timeout)?;
    let mut data = channel.read(FETCH_HALF, timeout)?;
    channel.write(&FETCH_PART_2, timeout)?;
    data.extend(channel.read(FETCH_HALF, timeout)?);

    data.as_slice()
        .try_into()
        .map_err(|_| AphidError::Framing {
            expected: SECTOR_SIZE,
            actual: data.len(),
        })
}

/// Upload a sector, with parity, into PRU 1's buffer for the Apple to read.
pub fn deliver_sector<C: Channel + ?Sized>(
    channel: &mut C,
    data: &Sector,
    timeout: Option<Duration>,
) -> AphidResult<()> {
    let payload = with_parity(data);
    for (offset, length) in DELIVER_CHUNKS {
        let mut message = Vec::with_capacity(HEADER_LEN + length);
        message.extend_from_slice(&header(MAGIC_DELIVER, offset, length));
        message.extend_from_slice(&payload[offset..offset + length]);
        channel.write(&message, timeout)?;
    }
    Ok(())
}

/// Let PRU 1 resume processing after a fetch or delivery.
pub fn resume<C: Channel + ?Sized>(channel: &mut C, timeout: Option<Duration>) -> AphidResult<()> {
    channel.write(&RESUME, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ScriptedChannel;

    #[test]
    fn test_parity_table() {
        for value in 0..=255u8 {
            let expected = if value.count_ones() % 2 == 0 { 0x00 } else { 0xFF };
            assert_eq!(PARITY[value as usize], expected, "value {value:#04X}");
        }
        assert_eq!(PARITY[0x00], 0x00);
        assert_eq!(PARITY[0x01], 0xFF);
        assert_eq!(PARITY[0x03], 0x00);
        assert_eq!(PARITY[0x07], 0xFF);
    }

    #[test]
    fn test_request_headers() {
        assert_eq!(FETCH_PART_1, [0x8C, 0xA9, 0x37, 0xF1, 0x00, 0x00, 0x0A, 0x01]);
        assert_eq!(FETCH_PART_2, [0x8C, 0xA9, 0x37, 0xF1, 0x0A, 0x01, 0x0A, 0x01]);
        assert_eq!(RESUME, [0xA6, 0x93, 0x73, 0xEA, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_fetch_assembles_halves() {
        let mut channel = ScriptedChannel::with_messages([vec![0x11u8; 266], vec![0x22u8; 266]]);
        let sector = fetch_sector(&mut channel, None).unwrap();

        assert!(sector[..266].iter().all(|&b| b == 0x11));
        assert!(sector[266..].iter().all(|&b| b == 0x22));
        assert_eq!(channel.written(), &[FETCH_PART_1.to_vec(), FETCH_PART_2.to_vec()]);
    }

    #[test]
    fn test_short_fetch_is_framing_error() {
        let mut channel = ScriptedChannel::with_messages([vec![0u8; 266], vec![0u8; 100]]);
        assert!(matches!(
            fetch_sector(&mut channel, None),
            Err(AphidError::Framing {
                expected: 532,
                actual: 366
            })
        ));
    }

    #[test]
    fn test_deliver_splits_parity_payload() {
        let mut data = [0u8; SECTOR_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut channel = ScriptedChannel::new();
        deliver_sector(&mut channel, &data, None).unwrap();

        let written = channel.written();
        assert_eq!(written.len(), 3);
        assert_eq!(&written[0][..4], &[0xDB, 0x95, 0x4B, 0xC7]);
        assert_eq!(&written[1][4..8], &[0x62, 0x01, 0x62, 0x01]); // offset 354, length 354
        assert_eq!(&written[2][4..8], &[0xC4, 0x02, 0x64, 0x01]); // offset 708, length 356
        assert_eq!(
            written.iter().map(|m| m.len() - HEADER_LEN).sum::<usize>(),
            2 * SECTOR_SIZE
        );

        let payload: Vec<u8> = written.iter().flat_map(|m| m[HEADER_LEN..].to_vec()).collect();
        for (i, pair) in payload.chunks(2).enumerate() {
            assert_eq!(pair[0], data[i]);
            assert_eq!(pair[1], PARITY[data[i] as usize]);
        }
    }
}
