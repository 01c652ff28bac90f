use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::time::Instant;

use tether_core::wire::FILE_CHUNK_SIZE;

use crate::*;

/// Drops (or corrupts) the first DATA packet carrying `seq`.
fn first_data_with(seq: u32, corrupt: bool) -> (Arc<Tap>, PacketFilter) {
    let done = Arc::new(AtomicBool::new(false));
    tap(move |p| {
        let hit = matches!(FilePacket::decode(p), Ok(FilePacket::Data(ref c)) if c.seq_no == seq);
        if hit && !done.swap(true, Ordering::SeqCst) {
            if !corrupt {
                return None;
            }
            let mut bytes = p.to_vec();
            let last = bytes.len() - 1;
            bytes[last] ^= 0x80;
            return Some(Bytes::from(bytes));
        }
        Some(p.clone())
    })
}

/// Drops the first `n` file FIN packets; with `seq`, also the first DATA
/// packet carrying it.
fn lose_fins(n: usize, seq: Option<u32>) -> (Arc<Tap>, PacketFilter) {
    let fins = Arc::new(AtomicUsize::new(0));
    let data_lost = Arc::new(AtomicBool::new(false));
    tap(move |p| match FilePacket::decode(p) {
        Ok(FilePacket::Fin { .. }) if fins.fetch_add(1, Ordering::SeqCst) < n => None,
        Ok(FilePacket::Data(ref c)) if Some(c.seq_no) == seq && !data_lost.swap(true, Ordering::SeqCst) => None,
        _ => Some(p.clone()),
    })
}

fn fin_count(tap: &Tap) -> usize {
    tap.files()
        .into_iter()
        .filter(|p| matches!(p, FilePacket::Fin { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn lost_fin_is_repeated_and_sweeps_the_gap() {
    let (sent, a_to_b) = lose_fins(1, Some(2));
    let (replies, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);
    let data = payload(5 * FILE_CHUNK_SIZE);

    let started = Instant::now();
    let report = link
        .alice
        .session
        .files()
        .send_bytes("gap.bin", data.clone())
        .unwrap()
        .wait()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.retransmits, 1);
    assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(30), "{elapsed:?}");
    assert_eq!(replies.file_nacks(), vec![2], "the repeated FIN drew the sweep");
    assert!(fin_count(&sent) >= 2);

    assert!(matches!(link.bob.next_event().await, TransferEvent::FileComplete { .. }));
    assert_eq!(std::fs::read(link.download.path().join("gap.bin")).unwrap(), data);
    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn lost_confirmations_are_recovered() {
    let (sent, a_to_b) = pass();
    // The completion echo and the answer to the stream's FIN both vanish.
    let (_, b_to_a) = lose_fins(2, None);
    let mut link = pair(a_to_b, b_to_a);

    let report = link
        .alice
        .session
        .files()
        .send_bytes("echo.bin", payload(3 * FILE_CHUNK_SIZE))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.retransmits, 0);
    assert!(fin_count(&sent) >= 2, "FIN repeated after the echoes were lost");
    assert!(matches!(link.bob.next_event().await, TransferEvent::FileComplete { .. }));
    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn clean_file_transfer() {
    let (sent, a_to_b) = pass();
    let (_, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);
    let data = payload(3 * FILE_CHUNK_SIZE + 17);

    let source = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(source.path(), &data).unwrap();
    let report = link
        .alice
        .session
        .send_file(source.path())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.chunks, 4);
    assert_eq!(report.retransmits, 0);

    match link.bob.next_event().await {
        TransferEvent::FileComplete {
            sender_id,
            file_id,
            path,
            size,
        } => {
            assert_eq!(sender_id, "alice");
            assert_eq!(file_id, report.file_id);
            assert_eq!(size, data.len() as u64);
            assert_eq!(path.parent(), Some(link.download.path()));
            assert_eq!(std::fs::read(&path).unwrap(), data);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(sent.file_data_seqs(), vec![0, 1, 2, 3]);
    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_chunk_is_nacked_once_and_resent_alone() {
    let (sent, a_to_b) = first_data_with(7, false);
    let (replies, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);
    let data = payload(10 * FILE_CHUNK_SIZE);

    let report = link
        .alice
        .session
        .files()
        .send_bytes("ten.bin", data.clone())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.chunks, 10);
    assert_eq!(report.retransmits, 1);

    assert_eq!(replies.file_nacks(), vec![7]);
    let seqs = sent.file_data_seqs();
    assert_eq!(seqs.len(), 11);
    assert_eq!(&seqs[..10], &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    assert_eq!(seqs[10], 7, "only chunk 7 is retransmitted");

    assert!(matches!(link.bob.next_event().await, TransferEvent::FileComplete { .. }));
    assert_eq!(std::fs::read(link.download.path().join("ten.bin")).unwrap(), data);
    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn corrupted_chunk_is_nacked_without_counting() {
    let (_, a_to_b) = first_data_with(3, true);
    let (replies, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);
    let data = payload(6 * FILE_CHUNK_SIZE);

    let report = link
        .alice
        .session
        .files()
        .send_bytes("six.bin", data.clone())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.retransmits, 1);
    assert_eq!(replies.file_nacks(), vec![3], "exactly one NACK for the bad chunk");

    assert!(matches!(link.bob.next_event().await, TransferEvent::FileComplete { .. }));
    assert_eq!(std::fs::read(link.download.path().join("six.bin")).unwrap(), data);
    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn empty_file_completes() {
    let (sent, a_to_b) = pass();
    let (_, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);

    let report = link
        .alice
        .session
        .files()
        .send_bytes("empty", Bytes::new())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.chunks, 0);
    assert!(sent.file_data_seqs().is_empty());

    assert!(matches!(link.bob.next_event().await, TransferEvent::FileComplete { size: 0, .. }));
    assert_eq!(std::fs::metadata(link.download.path().join("empty")).unwrap().len(), 0);
    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn existing_name_is_not_overwritten() {
    let (_, a_to_b) = pass();
    let (_, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);
    std::fs::write(link.download.path().join("dup.txt"), b"keep me").unwrap();

    let report = link
        .alice
        .session
        .files()
        .send_bytes("dup.txt", Bytes::from_static(b"new"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    let TransferEvent::FileComplete { path, .. } = link.bob.next_event().await else {
        panic!("expected file completion");
    };
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        format!("{}-dup.txt", report.file_id)
    );
    assert_eq!(std::fs::read(&path).unwrap(), b"new");
    assert_eq!(std::fs::read(link.download.path().join("dup.txt")).unwrap(), b"keep me");
    link.stop().await;
}
