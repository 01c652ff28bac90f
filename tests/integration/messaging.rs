use std::sync::atomic::{AtomicBool, Ordering};

use tether_core::wire::{signal, MessagePacket};

use crate::*;

#[tokio::test(start_paused = true)]
async fn five_thousand_bytes_arrive_in_five_chunks() {
    let (sent, a_to_b) = pass();
    let (acks, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);
    let data = payload(5000);

    let pending = link.alice.session.send_message(data.clone()).unwrap();
    let id = pending.id();
    pending.wait().await.unwrap();

    match link.bob.next_event().await {
        TransferEvent::MessageComplete {
            sender_id,
            message_id,
            bytes,
        } => {
            assert_eq!(sender_id, "alice");
            assert_eq!(message_id, id);
            assert_eq!(bytes, data);
        }
        other => panic!("unexpected {other:?}"),
    }

    let chunks: Vec<u32> = sent
        .messages()
        .into_iter()
        .filter_map(|p| match p {
            MessagePacket::Data(c) => Some(c.chunk_id),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![0, 1, 2, 3, 4], "each chunk exactly once");

    let full = acks
        .messages()
        .into_iter()
        .any(|p| matches!(p, MessagePacket::Ack { bitmap: 0b11111, message_id } if message_id == id));
    assert!(full, "final ACK carries all five bits");

    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn corrupted_chunk_draws_exactly_one_nack() {
    let flipped = Arc::new(AtomicBool::new(false));
    let flag = flipped.clone();
    let (_, a_to_b) = tap(move |p| {
        let target = matches!(
            MessagePacket::decode(p),
            Ok(MessagePacket::Data(ref c)) if c.chunk_id == 1
        );
        if target && !flag.swap(true, Ordering::SeqCst) {
            let mut bytes = p.to_vec();
            let last = bytes.len() - 1;
            bytes[last] ^= 0x01;
            return Some(Bytes::from(bytes));
        }
        Some(p.clone())
    });
    let (replies, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);

    link.alice
        .session
        .send_message(payload(3000))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(matches!(link.bob.next_event().await, TransferEvent::MessageComplete { bytes, .. } if bytes == payload(3000)));

    let nacks: Vec<u32> = replies
        .messages()
        .into_iter()
        .filter_map(|p| match p {
            MessagePacket::Nack { chunk_id, .. } => Some(chunk_id),
            _ => None,
        })
        .collect();
    assert_eq!(nacks, vec![1]);
    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn lost_chunk_is_recovered_by_timer() {
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = dropped.clone();
    let (sent, a_to_b) = tap(move |p| {
        let target = matches!(
            MessagePacket::decode(p),
            Ok(MessagePacket::Data(ref c)) if c.chunk_id == 2
        );
        if target && !flag.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(p.clone())
    });
    let (_, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);
    let data = payload(4 * 1131);

    let started = tokio::time::Instant::now();
    link.alice.session.send_message(data.clone()).unwrap().wait().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500), "waited for the RTO");
    assert!(matches!(link.bob.next_event().await, TransferEvent::MessageComplete { bytes, .. } if bytes == data));

    let resent = sent
        .messages()
        .into_iter()
        .filter(|p| matches!(p, MessagePacket::Data(c) if c.chunk_id == 2))
        .count();
    assert_eq!(resent, 2);
    let others = sent
        .messages()
        .into_iter()
        .filter(|p| matches!(p, MessagePacket::Data(c) if c.chunk_id != 2))
        .count();
    assert_eq!(others, 3, "acked chunks are not resent");
    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn replayed_packets_do_not_redeliver() {
    // Bob sees every messaging packet twice.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
    let (_, a_to_b) = tap(move |p| {
        if p.first().is_some_and(|s| (signal::MSG_DATA..=signal::MSG_FIN).contains(s)) {
            let _ = tx.send(p.clone());
        }
        Some(p.clone())
    });
    let (_, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);

    link.alice
        .session
        .send_message(payload(2500))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(matches!(link.bob.next_event().await, TransferEvent::MessageComplete { .. }));

    while let Ok(packet) = rx.try_recv() {
        link.bob.session.handle_inbound(packet);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(link.bob.events.try_recv().is_err(), "no second delivery");
    link.stop().await;
}
