use tether_core::wire::{signal, HandshakeKind, MessagePacket};
use tether_services::{ChannelState, TransferError};
use tokio::time::Instant;

use crate::*;

fn drop_signal(sig: u8) -> (Arc<Tap>, PacketFilter) {
    tap(move |p| if p.first() == Some(&sig) { None } else { Some(p.clone()) })
}

#[tokio::test(start_paused = true)]
async fn handshake_times_out_when_ack_never_arrives() {
    let (sent, a_to_b) = pass();
    let (_, b_to_a) = drop_signal(signal::FILE_ACK);
    let mut link = pair(a_to_b, b_to_a);

    let started = Instant::now();
    let pending = link
        .alice
        .session
        .files()
        .send_bytes("never.bin", payload(5 * 1450))
        .unwrap();
    let id = pending.id();
    let result = pending.wait().await;
    let elapsed = started.elapsed();

    assert_eq!(result, Err(TransferError::HandshakeTimeout(Duration::from_secs(30))));
    assert!(elapsed >= Duration::from_secs(30) && elapsed < Duration::from_secs(31));
    assert!(sent.file_data_seqs().is_empty(), "no DATA before the handshake");
    let syns = sent
        .files()
        .into_iter()
        .filter(|p| matches!(p, FilePacket::Handshake { kind: HandshakeKind::Syn, .. }))
        .count();
    assert!(syns >= 2, "SYN was retried");

    match link.alice.next_event().await {
        TransferEvent::Failed { transfer_id, reason } => {
            assert_eq!(transfer_id, id);
            assert!(reason.contains("handshake"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn message_fails_after_max_retries() {
    let (sent, a_to_b) = drop_signal(signal::MSG_DATA);
    let (_, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);

    let pending = link.alice.session.send_message(payload(100)).unwrap();
    let id = pending.id();
    assert_eq!(
        pending.wait().await,
        Err(TransferError::RetriesExhausted { chunk: 0, retries: 5 })
    );

    let transmissions = sent
        .messages()
        .into_iter()
        .filter(|p| matches!(p, MessagePacket::Data(_)))
        .count();
    assert_eq!(transmissions, 6, "one send plus five retries");
    assert_eq!(link.alice.session.messaging().live_sends(), 0);

    assert!(matches!(
        link.alice.next_event().await,
        TransferEvent::Failed { transfer_id, .. } if transfer_id == id
    ));
    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn declined_offer_times_out() {
    let (_, a_to_b) = pass();
    let (_, b_to_a) = pass();
    let link = pair_with(a_to_b, b_to_a, Some(Arc::new(RejectAll)));

    let started = Instant::now();
    let result = link
        .alice
        .session
        .files()
        .send_bytes("unwanted", payload(10))
        .unwrap()
        .wait()
        .await;
    assert_eq!(result, Err(TransferError::OfferTimeout(Duration::from_secs(60))));
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(link.bob.session.files().live_receives(), 0);
    link.stop().await;
}

#[tokio::test(start_paused = true)]
async fn oversized_message_is_refused_up_front() {
    let (sent, a_to_b) = pass();
    let (_, b_to_a) = pass();
    let link = pair(a_to_b, b_to_a);

    let too_big = payload(64 * 1131 + 1);
    assert_eq!(
        link.alice.session.send_message(too_big).unwrap_err(),
        TransferError::MessageTooLarge { size: 72_385, max: 72_384 }
    );
    assert!(sent.packets().is_empty());
    link.stop().await;
}

#[tokio::test]
async fn closed_channel_fails_fast() {
    let (a, _b) = LoopbackChannel::pair();
    a.channel.set_state(ChannelState::Closed);
    let session = PeerSession::new(
        a.channel,
        &TetherConfig::default(),
        "bob",
        Arc::new(tether_services::NullEvents),
        Arc::new(RejectAll),
    );

    assert_eq!(
        session.send_message(payload(10)).unwrap_err(),
        TransferError::ChannelNotOpen
    );
    assert_eq!(
        session.files().send_bytes("x", payload(10)).unwrap_err(),
        TransferError::ChannelNotOpen
    );
    assert_eq!(session.messaging().live_sends(), 0);
    assert_eq!(session.files().live_sends(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_receive_is_abandoned_and_partial_file_removed() {
    // Everything after the first DATA packet is lost, including FIN.
    let seen_data = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = seen_data.clone();
    let (_, a_to_b) = tap(move |p| match FilePacket::decode(p) {
        Ok(FilePacket::Data(_)) | Ok(FilePacket::Fin { .. }) => {
            if flag.swap(true, std::sync::atomic::Ordering::SeqCst) {
                None
            } else {
                Some(p.clone())
            }
        }
        _ => Some(p.clone()),
    });
    let (_, b_to_a) = pass();
    let mut link = pair(a_to_b, b_to_a);

    let pending = link
        .alice
        .session
        .files()
        .send_bytes("partial.bin", payload(4 * 1450))
        .unwrap();
    let id = pending.id();

    assert_eq!(pending.wait().await, Err(TransferError::NoConfirmation(Duration::from_secs(30))));

    match link.bob.next_event().await {
        TransferEvent::Failed { transfer_id, reason } => {
            assert_eq!(transfer_id, id);
            assert!(reason.contains("abandoned"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!link.download.path().join("partial.bin").exists());
    link.stop().await;
}
