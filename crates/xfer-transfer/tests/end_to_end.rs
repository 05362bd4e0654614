//! End-to-end scenarios driving a real [`Transfer`] through a linked
//! element chain, exercising the linker, the message bus, and the taper
//! destinations together rather than any one crate in isolation.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use xfer_crc::Crc32c;
use xfer_element::dest::{BufferDest, FdDest, NullDest};
use xfer_element::filter::{CrcFilter, XorFilter};
use xfer_element::source::{FileSource, PatternSource, RandomSource};
use xfer_element::ElementArc;
use xfer_message::{Message, MessageKind};
use xfer_taper::{CacherConfig, CachingMode, Device, PartHeader, TaperDestCacher};
use xfer_test_support::{expected_pattern_bytes, expected_random_bytes, FakeDevice};
use xfer_transfer::{Transfer, TransferStatus};

fn downcast<T: 'static>(element: &ElementArc) -> &T {
    let any: &dyn std::any::Any = element.as_ref();
    any.downcast_ref::<T>().expect("unexpected element type")
}

fn header(part_number: u64) -> PartHeader {
    PartHeader {
        part_number,
        file_number: 1,
        label: String::new(),
    }
}

/// Drains `transfer`'s inbox until its terminal `Done`, panicking if none
/// arrives within `timeout` of the last message (a hung transfer is a test
/// failure, not a thing to wait out indefinitely).
fn drain_until_done(transfer: &Arc<Transfer>, timeout: Duration) -> Vec<Message> {
    let mut messages = Vec::new();
    loop {
        let msg = transfer
            .inbox()
            .recv_timeout(timeout)
            .expect("transfer did not reach Done in time");
        let done = matches!(msg.kind(), MessageKind::Done { .. });
        messages.push(msg);
        if done {
            return messages;
        }
    }
}

#[test]
fn random_source_passes_through_to_buffer_unchanged() {
    let source = RandomSource::new(1024 * 1024, 0x1234);
    let dest = BufferDest::new(2 * 1024 * 1024);
    let dest_for_check = Arc::clone(&dest);

    let transfer = Transfer::new(vec![source, dest]);
    transfer.start(0, 0).unwrap();
    drain_until_done(&transfer, Duration::from_secs(10));

    assert_eq!(transfer.status(), TransferStatus::Done);
    let result = downcast::<BufferDest>(&dest_for_check);
    assert!(!result.overflowed());
    assert_eq!(result.get(), expected_random_bytes(1024 * 1024, 0x1234));
}

#[test]
fn split_with_memory_cache_produces_four_parts() {
    let total_len = 10 * 1024 * 1024u64;
    let part_size = 3 * 1024 * 1024u64;
    let block_size = 64 * 1024usize;

    let source = RandomSource::new(total_len, 1);
    let cacher_elem = TaperDestCacher::new(
        CacherConfig {
            max_memory: 4 * 1024 * 1024,
            part_size,
            caching_mode: CachingMode::Memory,
            disk_cache_dirname: None,
        },
        block_size,
    );
    let cacher_for_test = Arc::clone(&cacher_elem);

    let transfer = Transfer::new(vec![source, cacher_elem]);
    transfer.start(0, 0).unwrap();

    let cacher = downcast::<TaperDestCacher>(&cacher_for_test);
    let device = Arc::new(FakeDevice::new(block_size));
    cacher.use_device(Arc::clone(&device) as Arc<dyn Device>).unwrap();
    cacher.start_part(false, header(1)).unwrap();

    let mut parts = Vec::new();
    loop {
        let msg = transfer
            .inbox()
            .recv_timeout(Duration::from_secs(10))
            .expect("transfer stalled");
        match msg.kind() {
            MessageKind::PartDone(part) => {
                let part = part.clone();
                if !part.eof {
                    cacher.start_part(false, header(part.part_number + 1)).unwrap();
                }
                parts.push(part);
            }
            MessageKind::Done { .. } => break,
            MessageKind::Error(text) => panic!("unexpected error: {text}"),
            _ => {}
        }
    }

    assert_eq!(parts.len(), 4);
    let sizes: Vec<u64> = parts.iter().map(|p| p.size).collect();
    assert_eq!(sizes, vec![part_size, part_size, part_size, total_len - 3 * part_size]);
    for (i, part) in parts.iter().enumerate() {
        assert!(part.successful, "part {i} should have succeeded");
        assert_eq!(part.part_number, i as u64 + 1);
        assert_eq!(part.eof, i == parts.len() - 1);
    }
    assert_eq!(device.written(), expected_random_bytes(total_len, 1));
}

#[test]
fn retry_after_simulated_eom_recovers_the_part() {
    let part_size = 3 * 1024 * 1024u64;
    let block_size = 64 * 1024usize;

    let source = RandomSource::new(part_size, 2);
    let cacher_elem = TaperDestCacher::new(
        CacherConfig {
            max_memory: 4 * 1024 * 1024,
            part_size,
            caching_mode: CachingMode::Memory,
            disk_cache_dirname: None,
        },
        block_size,
    );
    let cacher_for_test = Arc::clone(&cacher_elem);

    let transfer = Transfer::new(vec![source, cacher_elem]);
    transfer.start(0, 0).unwrap();
    let cacher = downcast::<TaperDestCacher>(&cacher_for_test);

    let failing_device = Arc::new(FakeDevice::with_eom_after(block_size, 2 * 1024 * 1024));
    cacher.use_device(Arc::clone(&failing_device) as Arc<dyn Device>).unwrap();
    cacher.start_part(false, header(1)).unwrap();

    let first = match transfer
        .inbox()
        .recv_timeout(Duration::from_secs(10))
        .expect("transfer stalled")
        .kind()
    {
        MessageKind::PartDone(part) => part.clone(),
        other => panic!("expected PartDone, got {other:?}"),
    };
    assert!(!first.successful);
    assert!(first.eom);
    assert_eq!(first.size, 2 * 1024 * 1024);

    let good_device = Arc::new(FakeDevice::new(block_size));
    cacher.use_device(Arc::clone(&good_device) as Arc<dyn Device>).unwrap();
    cacher.start_part(true, header(1)).unwrap();

    loop {
        let msg = transfer
            .inbox()
            .recv_timeout(Duration::from_secs(10))
            .expect("transfer stalled");
        match msg.kind() {
            MessageKind::PartDone(part) => {
                assert!(part.successful);
                assert!(part.eof);
                assert_eq!(part.size, part_size);
            }
            MessageKind::Done { .. } => break,
            MessageKind::Error(text) => panic!("unexpected error: {text}"),
            _ => {}
        }
    }

    assert_eq!(good_device.written(), expected_random_bytes(part_size, 2));
}

#[test]
fn crc_filter_reports_correct_digest() {
    let pattern = vec![0x12u8, 0x34, 0x56];
    let length = 1_000_000u64;

    let source = PatternSource::new(length, pattern.clone());
    let crc_filter = CrcFilter::new();
    let dest = NullDest::new();

    let transfer = Transfer::new(vec![source, crc_filter, dest]);
    transfer.start(0, 0).unwrap();
    let messages = drain_until_done(&transfer, Duration::from_secs(10));

    let crc = match messages.last().expect("at least a Done message").kind() {
        MessageKind::Done { crc } => crc.expect("crc filter should attach a digest to Done"),
        other => panic!("expected Done, got {other:?}"),
    };

    let mut expected = Crc32c::new();
    expected.update(&expected_pattern_bytes(length, &pattern));
    assert_eq!(crc.value, expected.value());
    assert_eq!(crc.size, expected.size());
}

#[test]
fn cancel_during_push_stops_promptly_without_finishing() {
    let total_len = 100 * 1024 * 1024u64;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let reader = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // Nobody drains the socket for a while, so the writer fills the
        // kernel send buffer and blocks -- simulating a stalled device.
        thread::sleep(Duration::from_millis(400));
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n as u64,
            }
        }
        total
    });

    let write_stream = TcpStream::connect(addr).unwrap();
    let dest = FdDest::new(write_stream.as_raw_fd()).unwrap();
    drop(write_stream);
    let source = RandomSource::new(total_len, 0xCA7);

    let transfer = Transfer::new(vec![source, dest]);
    transfer.start(0, 0).unwrap();

    thread::sleep(Duration::from_millis(100));
    transfer.cancel();

    let messages = drain_until_done(&transfer, Duration::from_secs(5));
    assert_eq!(transfer.status(), TransferStatus::Done);
    assert!(!messages.iter().any(|m| matches!(m.kind(), MessageKind::PartDone(_))));

    let total_read = reader.join().expect("reader thread panicked");
    assert!(
        total_read < total_len,
        "transfer should have been cancelled before the whole stream was written"
    );
}

#[test]
fn no_split_baseline_is_a_single_part() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    let content = expected_pattern_bytes(1024 * 1024, &[0xAB]);
    tmp.write_all(&content).unwrap();
    tmp.flush().unwrap();

    let source = FileSource::new(tmp.path()).unwrap();
    let cacher_elem = TaperDestCacher::new(
        CacherConfig {
            max_memory: 1024 * 1024,
            part_size: 0,
            caching_mode: CachingMode::None,
            disk_cache_dirname: None,
        },
        64 * 1024,
    );
    let cacher_for_test = Arc::clone(&cacher_elem);

    let transfer = Transfer::new(vec![source, cacher_elem]);
    transfer.start(0, 0).unwrap();

    let cacher = downcast::<TaperDestCacher>(&cacher_for_test);
    let device = Arc::new(FakeDevice::new(64 * 1024));
    cacher.use_device(Arc::clone(&device) as Arc<dyn Device>).unwrap();
    cacher.start_part(false, header(1)).unwrap();

    let messages = drain_until_done(&transfer, Duration::from_secs(10));
    let parts: Vec<_> = messages
        .iter()
        .filter_map(|m| match m.kind() {
            MessageKind::PartDone(part) => Some(part.clone()),
            _ => None,
        })
        .collect();

    assert_eq!(parts.len(), 1);
    assert!(parts[0].successful);
    assert!(parts[0].eof);
    assert_eq!(parts[0].part_number, 1);
    assert_eq!(device.written(), content);
}

#[test]
fn xor_filter_applied_twice_is_the_identity() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    let content = expected_random_bytes(256 * 1024, 0xFEED);
    tmp.write_all(&content).unwrap();
    tmp.flush().unwrap();

    let source = FileSource::new(tmp.path()).unwrap();
    let filter_a = XorFilter::new(0x5A);
    let filter_b = XorFilter::new(0x5A);
    let dest = BufferDest::new(1024 * 1024);
    let dest_for_check = Arc::clone(&dest);

    let transfer = Transfer::new(vec![source, filter_a, filter_b, dest]);
    transfer.start(0, 0).unwrap();
    drain_until_done(&transfer, Duration::from_secs(10));

    let result = downcast::<BufferDest>(&dest_for_check);
    assert_eq!(result.get(), content);
}
