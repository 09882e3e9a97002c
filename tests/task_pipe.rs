//! Task pipe semantics across fibers and OS threads.

use std::time::{Duration, Instant};

use weft::fiber;
use weft::runtime::Runtime;
use weft::stream::{IoMode, TaskPipe};

/// A reader of 2100 bytes and a writer of 2100 bytes on a pipe of
/// capacity 2048 must complete regardless of which side starts first.
#[test]
fn oversized_transfer_completes_in_both_orders() {
    for reader_first in [true, false] {
        let rt = Runtime::new().unwrap();
        rt.run(move || {
            let started = Instant::now();
            let pipe = TaskPipe::new(2048, false);
            let payload: Vec<u8> = (0..2100u32).map(|i| (i % 251) as u8).collect();

            let reader_pipe = pipe.clone();
            let expected = payload.clone();
            let reader = move || {
                let mut buf = vec![0u8; 2100];
                reader_pipe.read(&mut buf, IoMode::All).unwrap();
                assert_eq!(buf, expected);
            };
            let writer_pipe = pipe.clone();
            let writer = move || {
                writer_pipe.write_all(&payload).unwrap();
            };

            let (a, b) = if reader_first {
                (fiber::defer(reader), fiber::defer(writer))
            } else {
                (fiber::defer(writer), fiber::defer(reader))
            };
            a.join().unwrap();
            b.join().unwrap();
            assert!(
                started.elapsed() < Duration::from_millis(500),
                "transfer took {:?}",
                started.elapsed()
            );
        })
        .unwrap();
    }
}

#[test]
fn bytes_cross_os_thread_boundary() {
    let rt = Runtime::new().unwrap();
    rt.run(|| {
        let pipe = TaskPipe::new(64, false);
        let writer_pipe = pipe.clone();
        // A plain OS thread outside the runtime writes...
        let writer = std::thread::spawn(move || {
            for i in 0..1000u32 {
                writer_pipe.write_all(&i.to_be_bytes()).unwrap();
            }
            writer_pipe.close();
        });
        // ...while a fiber reads.
        let mut buf = [0u8; 4];
        for i in 0..1000u32 {
            pipe.read(&mut buf, IoMode::All).unwrap();
            assert_eq!(u32::from_be_bytes(buf), i);
        }
        assert_eq!(pipe.read(&mut buf, IoMode::Once).unwrap(), 0);
        writer.join().unwrap();
    })
    .unwrap();
}

#[test]
fn interleaved_writes_preserve_fifo_order() {
    let rt = Runtime::new().unwrap();
    rt.run(|| {
        let pipe = TaskPipe::new(8, false);
        let writer_pipe = pipe.clone();
        let writer = fiber::defer(move || {
            for chunk in (0..500u16).map(|i| i.to_be_bytes()) {
                writer_pipe.write_all(&chunk).unwrap();
            }
            writer_pipe.close();
        });
        let mut received = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = pipe.read(&mut buf, IoMode::Once).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        writer.join().unwrap();
        let expected: Vec<u8> = (0..500u16).flat_map(|i| i.to_be_bytes()).collect();
        assert_eq!(received, expected);
    })
    .unwrap();
}

#[test]
fn wait_for_data_times_out_without_waking_early() {
    let rt = Runtime::new().unwrap();
    rt.run(|| {
        let pipe = TaskPipe::new(16, false);
        let started = Instant::now();
        assert!(!pipe.wait_for_data(Duration::from_millis(30)).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(30));
    })
    .unwrap();
}
