//! End-to-end transfers over loopback TCP.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use fanout_core::handshake::{Ack, Codec};
use fanout_core::{
    progress_channel, Dispatcher, Listener, ListenerHandle, ProgressRx, ReceiverLog, SessionEvent,
    SessionState, TransferConfig, TransferError, TransferRequest, WireFormat,
};
use storage::{LocalStorage, PathPolicy};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn pattern(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed;
    (0..len)
        .map(|_| {
            x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (x >> 16) as u8
        })
        .collect()
}

fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn loopback_config(save_dir: PathBuf) -> TransferConfig {
    TransferConfig {
        listen_host: "127.0.0.1".into(),
        ..TransferConfig::default()
    }
    .with_port(0)
    .with_save_dir(save_dir)
}

async fn start_receiver(save_dir: PathBuf, format: WireFormat) -> Result<ListenerHandle> {
    let cfg = loopback_config(save_dir.clone()).with_wire_format(format);
    let storage = LocalStorage::new(save_dir, PathPolicy::Confine)?;
    Ok(Listener::bind(cfg, storage, ReceiverLog::tracing_only()).await?.spawn()?)
}

/// Drain the progress channel until every session has reported a terminal event.
async fn collect_until_done(rx: &mut ProgressRx, sessions: usize) -> HashMap<String, Vec<SessionEvent>> {
    let mut events: HashMap<String, Vec<SessionEvent>> = HashMap::new();
    let mut done = 0;
    while done < sessions {
        let update = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("progress stalled")
            .expect("progress channel closed early");
        if update.event.is_terminal() {
            done += 1;
        }
        events.entry(update.target).or_default().push(update.event);
    }
    events
}

fn states(events: &[SessionEvent]) -> Vec<SessionState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::State { state } => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_ten_mib_to_two_targets() -> Result<()> {
    let temp = TempDir::new()?;
    let data = pattern(10 * 1024 * 1024, 7);
    let source = write_source(temp.path(), "big.bin", &data);

    let first = start_receiver(temp.path().join("one"), WireFormat::Framed).await?;
    let second = start_receiver(temp.path().join("two"), WireFormat::Framed).await?;
    let targets = vec![first.local_addr().to_string(), second.local_addr().to_string()];

    let dispatcher = Dispatcher::new(TransferConfig::default());
    let (tx, mut rx) = progress_channel();
    let dispatch = dispatcher.dispatch(TransferRequest::new(&source, targets.clone())?, tx);

    let events = collect_until_done(&mut rx, 2).await;
    for (target, result) in dispatch.wait_all().await {
        let report = result?;
        assert_eq!(report.sent, data.len() as u64, "{target}");
    }

    for target in &targets {
        let events = &events[target];
        assert_eq!(
            states(events),
            vec![
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::SendingFilename,
                SessionState::AwaitFilenameAck,
                SessionState::SendingSize,
                SessionState::AwaitSizeAck,
                SessionState::Streaming,
            ]
        );

        let mut last_percent = 0;
        let mut samples = 0;
        for event in events {
            if let SessionEvent::Progress { percent, rate, total, .. } = event {
                assert!(*percent >= last_percent, "percent went backwards");
                assert_eq!(*total, data.len() as u64);
                last_percent = *percent;
                samples += rate.is_some() as u32;
            }
        }
        assert_eq!(last_percent, 100);

        match events.last() {
            Some(SessionEvent::Completed { sent, elapsed_secs }) => {
                assert_eq!(*sent, data.len() as u64);
                // Samples need 0.5s of spacing each
                assert!(samples as f64 <= (elapsed_secs / 0.5).floor());
            }
            other => panic!("{target} ended with {other:?}"),
        }
    }

    first.shutdown().await?;
    second.shutdown().await?;
    assert_eq!(std::fs::read(temp.path().join("one/big.bin"))?, data);
    assert_eq!(std::fs::read(temp.path().join("two/big.bin"))?, data);
    Ok(())
}

#[tokio::test]
async fn test_refused_target_fails_within_connect_timeout() -> Result<()> {
    let temp = TempDir::new()?;
    let source = write_source(temp.path(), "f.bin", b"payload");

    let closed = TcpListener::bind("127.0.0.1:0").await?;
    let addr = closed.local_addr()?;
    drop(closed);

    let (tx, mut rx) = progress_channel();
    let started = Instant::now();
    let dispatch = Dispatcher::new(TransferConfig::default())
        .dispatch(TransferRequest::new(&source, [addr.to_string()])?, tx);

    let events = collect_until_done(&mut rx, 1).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    match events[&addr.to_string()].last() {
        Some(SessionEvent::Failed { state, .. }) => assert_eq!(*state, SessionState::Connecting),
        other => panic!("unexpected terminal event {other:?}"),
    }
    let (_, result) = dispatch.wait_all().await.remove(0);
    assert!(matches!(result, Err(TransferError::Connect { .. })));
    Ok(())
}

#[tokio::test]
async fn test_one_bad_target_does_not_affect_another() -> Result<()> {
    let temp = TempDir::new()?;
    let data = pattern(300_000, 3);
    let source = write_source(temp.path(), "mixed.bin", &data);

    let good = start_receiver(temp.path().join("good"), WireFormat::Framed).await?;
    let closed = TcpListener::bind("127.0.0.1:0").await?;
    let bad = closed.local_addr()?.to_string();
    drop(closed);

    let (tx, mut rx) = progress_channel();
    let dispatch = Dispatcher::new(TransferConfig::default()).dispatch(
        TransferRequest::new(&source, [bad.clone(), good.local_addr().to_string()])?,
        tx,
    );
    collect_until_done(&mut rx, 2).await;

    let results = dispatch.wait_all().await;
    assert!(results[0].1.is_err());
    assert_eq!(results[1].1.as_ref().map(|r| r.sent).ok(), Some(data.len() as u64));

    good.shutdown().await?;
    assert_eq!(std::fs::read(temp.path().join("good/mixed.bin"))?, data);
    Ok(())
}

#[tokio::test]
async fn test_legacy_wire_format_round_trip() -> Result<()> {
    let temp = TempDir::new()?;
    let data = pattern(123_457, 11);
    let source = write_source(temp.path(), "legacy name.dat", &data);
    let receiver = start_receiver(temp.path().join("in"), WireFormat::Legacy).await?;

    let cfg = TransferConfig::default().with_wire_format(WireFormat::Legacy);
    let (tx, _rx) = progress_channel();
    let dispatch = Dispatcher::new(cfg)
        .dispatch(TransferRequest::new(&source, [receiver.local_addr().to_string()])?, tx);

    for (_, result) in dispatch.wait_all().await {
        result?;
    }
    let summary = receiver.shutdown().await?;
    assert_eq!(summary.completed, 1);
    assert_eq!(std::fs::read(temp.path().join("in/legacy name.dat"))?, data);
    Ok(())
}

#[tokio::test]
async fn test_empty_file_completes_at_full_percent() -> Result<()> {
    let temp = TempDir::new()?;
    let source = write_source(temp.path(), "empty", b"");
    let receiver = start_receiver(temp.path().join("in"), WireFormat::Framed).await?;
    let target = receiver.local_addr().to_string();

    let (tx, mut rx) = progress_channel();
    let _detached = Dispatcher::new(TransferConfig::default())
        .dispatch(TransferRequest::new(&source, [target.clone()])?, tx);
    let events = collect_until_done(&mut rx, 1).await;
    assert!(matches!(events[&target].last(), Some(SessionEvent::Completed { sent: 0, .. })));

    receiver.shutdown().await?;
    assert_eq!(std::fs::metadata(temp.path().join("in/empty"))?.len(), 0);
    Ok(())
}

/// Receiver that answers with the given acks and then holds the socket open
/// without reading.
async fn fake_receiver(filename_ack: &'static [u8], size_ack: &'static [u8]) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let codec = Codec::new(WireFormat::Framed, None, CancellationToken::new());
        let _ = codec.recv_filename(&mut stream).await;
        stream.write_all(&(filename_ack.len() as u32).to_be_bytes()).await.unwrap();
        stream.write_all(filename_ack).await.unwrap();
        let _ = codec.recv_size(&mut stream).await;
        let _ = stream.write_all(&(size_ack.len() as u32).to_be_bytes()).await;
        let _ = stream.write_all(size_ack).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });
    Ok(addr)
}

#[tokio::test]
async fn test_wrong_filename_ack_fails_session() -> Result<()> {
    let temp = TempDir::new()?;
    let source = write_source(temp.path(), "f.bin", b"abc");
    let target = fake_receiver(b"Filename recieved", Ack::FileSize.token()).await?;

    let (tx, mut rx) = progress_channel();
    let dispatch = Dispatcher::new(TransferConfig::default())
        .dispatch(TransferRequest::new(&source, [target.clone()])?, tx);
    let events = collect_until_done(&mut rx, 1).await;

    match events[&target].last() {
        Some(SessionEvent::Failed { state, cause, detail }) => {
            assert_eq!(*state, SessionState::AwaitFilenameAck);
            assert_eq!(detail, "peer did not acknowledge filename");
            assert_eq!(cause, "peer did not acknowl");
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
    let (_, result) = dispatch.wait_all().await.remove(0);
    assert!(matches!(result, Err(TransferError::AckMismatch { ack: Ack::Filename, .. })));
    Ok(())
}

#[tokio::test]
async fn test_wrong_size_ack_fails_session() -> Result<()> {
    let temp = TempDir::new()?;
    let source = write_source(temp.path(), "f.bin", b"abc");
    let target = fake_receiver(Ack::Filename.token(), b"OK").await?;

    let (tx, _rx) = progress_channel();
    let dispatch = Dispatcher::new(TransferConfig::default())
        .dispatch(TransferRequest::new(&source, [target])?, tx);

    let (_, result) = dispatch.wait_all().await.remove(0);
    match result {
        Err(e @ TransferError::AckMismatch { ack: Ack::FileSize, .. }) => {
            assert_eq!(e.to_string(), "peer did not acknowledge file size");
        }
        other => panic!("unexpected result {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_cancel_stops_stalled_stream() -> Result<()> {
    let temp = TempDir::new()?;
    let source = write_source(temp.path(), "huge.bin", &vec![0u8; 32 * 1024 * 1024]);
    let target = fake_receiver(Ack::Filename.token(), Ack::FileSize.token()).await?;

    let cfg = TransferConfig {
        io_timeout_ms: None,
        ..TransferConfig::default()
    };
    let (tx, mut rx) = progress_channel();
    let dispatch = Dispatcher::new(cfg).dispatch(TransferRequest::new(&source, [target])?, tx);

    // Wait until bytes are flowing, then cancel
    loop {
        let update = rx.recv().await.expect("channel closed");
        if matches!(update.event, SessionEvent::Progress { .. }) {
            break;
        }
    }
    dispatch.cancel_all();

    let (_, result) = tokio::time::timeout(Duration::from_secs(5), dispatch.wait_all())
        .await?
        .remove(0);
    assert!(matches!(result, Err(TransferError::Cancelled)));
    Ok(())
}

#[tokio::test]
async fn test_io_timeout_bounds_stalled_receiver() -> Result<()> {
    let temp = TempDir::new()?;
    let source = write_source(temp.path(), "huge.bin", &vec![0u8; 32 * 1024 * 1024]);
    let target = fake_receiver(Ack::Filename.token(), Ack::FileSize.token()).await?;

    let cfg = TransferConfig {
        io_timeout_ms: Some(300),
        ..TransferConfig::default()
    };
    let (tx, _rx) = progress_channel();
    let dispatch = Dispatcher::new(cfg).dispatch(TransferRequest::new(&source, [target])?, tx);

    let (_, result) = tokio::time::timeout(Duration::from_secs(10), dispatch.wait_all())
        .await?
        .remove(0);
    assert!(matches!(result, Err(TransferError::Timeout { op: "write chunk", .. })));
    Ok(())
}

#[tokio::test]
async fn test_peer_closing_early_leaves_short_file() -> Result<()> {
    let temp = TempDir::new()?;
    let receiver = start_receiver(temp.path().join("in"), WireFormat::Framed).await?;
    let codec = Codec::new(WireFormat::Framed, Some(Duration::from_secs(5)), CancellationToken::new());

    let mut stream = TcpStream::connect(receiver.local_addr()).await?;
    codec.send_filename(&mut stream, "partial.bin").await?;
    codec.expect_ack(&mut stream, Ack::Filename).await?;
    codec.send_size(&mut stream, 5000).await?;
    codec.expect_ack(&mut stream, Ack::FileSize).await?;
    codec.write_chunk(&mut stream, &[42u8; 1000]).await?;
    drop(stream);

    let summary = receiver.shutdown().await?;
    assert_eq!(summary.short, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(std::fs::read(temp.path().join("in/partial.bin"))?, vec![42u8; 1000]);
    Ok(())
}

/// Two senders, one receiver, same declared filename. Nothing coordinates the
/// writers: the result is one input in full or a byte-wise mix of both, and
/// neither side sees an error.
#[tokio::test]
async fn test_same_filename_race_is_last_writer_wins() -> Result<()> {
    let temp = TempDir::new()?;
    let len = 256 * 1024;
    let a_dir = temp.path().join("a");
    let b_dir = temp.path().join("b");
    std::fs::create_dir_all(&a_dir)?;
    std::fs::create_dir_all(&b_dir)?;
    let a = write_source(&a_dir, "same.bin", &vec![0xAA; len]);
    let b = write_source(&b_dir, "same.bin", &vec![0xBB; len]);

    let receiver = start_receiver(temp.path().join("in"), WireFormat::Framed).await?;
    let target = receiver.local_addr().to_string();

    let (tx, _rx) = progress_channel();
    let dispatcher = Dispatcher::new(TransferConfig::default());
    let first = dispatcher.dispatch(TransferRequest::new(&a, [target.clone()])?, tx.clone());
    let second = dispatcher.dispatch(TransferRequest::new(&b, [target])?, tx);

    let (r1, r2) = tokio::join!(first.wait_all(), second.wait_all());
    assert!(r1[0].1.is_ok());
    assert!(r2[0].1.is_ok());

    let summary = receiver.shutdown().await?;
    assert_eq!(summary.completed, 2);

    let stored = std::fs::read(temp.path().join("in/same.bin"))?;
    assert_eq!(stored.len(), len);
    assert!(stored.iter().all(|&byte| byte == 0xAA || byte == 0xBB));
    let from_a = stored.iter().filter(|&&byte| byte == 0xAA).count();
    println!("same.bin: {} bytes from a, {} from b", from_a, len - from_a);
    Ok(())
}
