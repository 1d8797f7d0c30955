//! End-to-end sessions over a socket, with a thread standing in for PRU 1.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::Duration;

use aphid_core::command::addr;
use aphid_core::extension::ExtensionContext;
use aphid_core::framer::{FETCH_HALF, FETCH_PART_1, FETCH_PART_2, HEADER_LEN, PARITY, RESUME};
use aphid_core::store::{make_spare_table, to_sector, IMAGE_SIZE_P10};
use aphid_core::{
    run_sessions, CancelToken, Command, ExitReason, Operation, PollChannel, Sector, SessionConfig,
    SECTOR_SIZE,
};

/// Bytes PRU 1 receives for one delivered sector: three headed chunks.
const DELIVERY_LEN: usize = 3 * HEADER_LEN + 2 * SECTOR_SIZE;

/// The PRU 1 side of the conversation.
struct FakePru {
    stream: UnixStream,
}

impl FakePru {
    fn send_command(&mut self, operation: Operation, address: u32, retry: u8, sparing: u8) {
        let command = Command {
            operation,
            address,
            retry_count: retry,
            sparing_threshold: sparing,
        };
        self.stream.write_all(&command.encode()).unwrap();
    }

    fn expect(&mut self, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        self.stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, expected);
    }

    /// Read a block; returns the data and checks the parity bytes.
    fn read_block(&mut self, address: u32) -> Sector {
        self.send_command(Operation::Read, address, 0, 0);
        let mut raw = vec![0u8; DELIVERY_LEN];
        self.stream.read_exact(&mut raw).unwrap();
        self.expect(&RESUME);

        let payload = strip_headers(&raw);
        let mut sector = [0u8; SECTOR_SIZE];
        for (i, pair) in payload.chunks(2).enumerate() {
            assert_eq!(pair[1], PARITY[pair[0] as usize]);
            sector[i] = pair[0];
        }
        sector
    }

    /// Write a block, answering both fetch requests.
    fn write_block(&mut self, address: u32, retry: u8, sparing: u8, data: &Sector) {
        self.send_command(Operation::Write, address, retry, sparing);
        self.expect(&FETCH_PART_1);
        self.stream.write_all(&data[..FETCH_HALF]).unwrap();
        self.expect(&FETCH_PART_2);
        self.stream.write_all(&data[FETCH_HALF..]).unwrap();
        self.expect(&RESUME);
    }

    fn conclude(&mut self, text: &[u8]) {
        self.write_block(
            addr::CONCLUSION,
            addr::CONCLUSION_RETRY_COUNT,
            addr::CONCLUSION_SPARING_THRESHOLD,
            &to_sector(text),
        );
    }
}

fn strip_headers(raw: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 * SECTOR_SIZE);
    let mut rest = raw;
    while !rest.is_empty() {
        let length = u16::from_le_bytes([rest[6], rest[7]]) as usize;
        payload.extend_from_slice(&rest[HEADER_LEN..HEADER_LEN + length]);
        rest = &rest[HEADER_LEN + length..];
    }
    payload
}

fn config(dir: &Path, image: &str) -> SessionConfig {
    SessionConfig {
        image_path: dir.join(image),
        flush_delay: Duration::from_millis(20),
        extensions: ExtensionContext {
            working_dir: dir.to_path_buf(),
            selector_dir: dir.join("selector"),
            flush_delay: Duration::from_millis(20),
        },
        extension_table: Vec::new(),
        ..SessionConfig::default()
    }
}

fn socket_pair() -> (PollChannel<UnixStream>, FakePru) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    theirs.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    (PollChannel::new(ours), FakePru { stream: theirs })
}

#[test]
fn test_serve_image_then_halt() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lisa.image"), vec![0u8; 8 * SECTOR_SIZE]).unwrap();
    let (mut channel, mut pru) = socket_pair();

    let apple = thread::spawn(move || {
        let spare = pru.read_block(addr::SPARE_TABLE);

        let data = [0xC3u8; SECTOR_SIZE];
        pru.write_block(5, 0x0A, 0x03, &data);
        let back = pru.read_block(5);
        let last = pru.read_block(addr::LAST_BUFFER);

        pru.conclude(b"HALT");
        (spare, data, back, last)
    });

    let reason = run_sessions(&mut channel, &config(dir.path(), "lisa.image"), &CancelToken::new());
    let (spare, data, back, last) = apple.join().unwrap();

    assert_eq!(reason, ExitReason::Halted);
    assert_eq!(spare, make_spare_table(8 * SECTOR_SIZE as u64));
    assert_eq!(back, data);
    assert_eq!(last, data);

    let image = std::fs::read(dir.path().join("lisa.image")).unwrap();
    assert!(image[5 * SECTOR_SIZE..6 * SECTOR_SIZE].iter().all(|&b| b == 0xC3));
}

#[test]
fn test_conclusion_moves_to_next_image() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("first.image"), vec![0u8; 4 * SECTOR_SIZE]).unwrap();
    let second = std::fs::File::create(dir.path().join("second.image")).unwrap();
    second.set_len(IMAGE_SIZE_P10).unwrap();
    drop(second);
    let (mut channel, mut pru) = socket_pair();

    let apple = thread::spawn(move || {
        pru.conclude(b"IMAGE:second.image");
        let spare = pru.read_block(addr::SPARE_TABLE);
        pru.conclude(b"HALT");
        spare
    });

    let reason = run_sessions(&mut channel, &config(dir.path(), "first.image"), &CancelToken::new());
    let spare = apple.join().unwrap();

    assert_eq!(reason, ExitReason::Halted);
    assert_eq!(&spare[..13], b"PROFILE 10M  ");
}

#[test]
fn test_cancel_stops_idle_emulator() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("idle.image"), vec![0u8; SECTOR_SIZE]).unwrap();
    let (mut channel, _pru) = socket_pair();

    let cancel = CancelToken::new();
    let stopper = cancel.clone();
    let timer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        stopper.cancel();
    });

    let reason = run_sessions(&mut channel, &config(dir.path(), "idle.image"), &cancel);
    timer.join().unwrap();
    assert_eq!(reason, ExitReason::Interrupted);
}
