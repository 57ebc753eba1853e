mod common;

use std::rc::Rc;

use common::{mac, RecordingEmulation, ScriptedLink};
use proptest::prelude::*;
use vnet_nic::{drain_rx, HeapDma, RxStats};

fn frames(count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| vec![i as u8; 60 + i]).collect()
}

#[test]
fn empty_link_completes_nothing() {
    let dma = Rc::new(HeapDma::new());
    let mut emul = RecordingEmulation::new(dma.clone(), 4);
    let mut link = ScriptedLink::new(mac(1), Vec::new());
    let mut stats = RxStats::default();

    let counts = drain_rx(&mut emul, &mut link, &mut stats);
    assert_eq!((counts.delivered, counts.dropped), (0, 0));
    assert!(emul.completion_batches.is_empty());
    assert_eq!(link.polls, 1);
    assert_eq!(stats.drains, 1);
}

#[test]
fn frames_arrive_in_order_one_completion_each() {
    let dma = Rc::new(HeapDma::new());
    let mut emul = RecordingEmulation::new(dma.clone(), 8);
    let expected = frames(3);
    let mut link = ScriptedLink::new(mac(1), expected.clone());
    let mut stats = RxStats::default();

    let counts = drain_rx(&mut emul, &mut link, &mut stats);
    assert_eq!(counts.delivered, 3);
    assert_eq!(emul.delivered, expected);
    assert_eq!(emul.completion_batches, vec![1, 1, 1]);
    // Stops on the last frame without polling an empty link.
    assert_eq!(link.polls, 3);
    assert_eq!(dma.outstanding(), 0);
    assert_eq!(stats.frames, 3);
}

#[test]
fn missing_buffers_drop_frames_and_draining_continues() {
    let dma = Rc::new(HeapDma::new());
    let mut emul = RecordingEmulation::new(dma.clone(), 2);
    let sent = frames(5);
    let mut link = ScriptedLink::new(mac(1), sent.clone());
    let mut stats = RxStats::default();

    let counts = drain_rx(&mut emul, &mut link, &mut stats);
    assert_eq!(counts.delivered, 2);
    assert_eq!(counts.dropped, 3);
    assert_eq!(emul.delivered, sent[..2].to_vec());
    assert_eq!(emul.completion_batches.len(), 2);
    assert_eq!(link.remaining(), 0);
    assert_eq!(stats.dropped_no_buffer, 3);
    assert_eq!(dma.outstanding(), 0);
}

#[test]
fn staging_exhaustion_drops_without_completing() {
    let dma = Rc::new(HeapDma::with_budget(64));
    let mut emul = RecordingEmulation::new(dma.clone(), 8);
    let mut link = ScriptedLink::new(mac(1), vec![vec![1; 100], vec![2; 40]]);
    let mut stats = RxStats::default();

    let counts = drain_rx(&mut emul, &mut link, &mut stats);
    assert_eq!((counts.delivered, counts.dropped), (1, 1));
    assert_eq!(emul.delivered, vec![vec![2; 40]]);
    assert_eq!(dma.failures(), 1);
}

proptest! {
    #[test]
    fn drain_completes_exactly_the_pending_frames(pending in 0usize..40, buffers in 0usize..40) {
        let dma = Rc::new(HeapDma::new());
        let mut emul = RecordingEmulation::new(dma.clone(), buffers);
        let mut link = ScriptedLink::new(mac(1), frames(pending));
        let mut stats = RxStats::default();

        let counts = drain_rx(&mut emul, &mut link, &mut stats);
        prop_assert_eq!(counts.delivered, pending.min(buffers));
        prop_assert_eq!(counts.total(), pending);
        prop_assert_eq!(emul.completion_batches.len(), pending.min(buffers));
        prop_assert_eq!(link.remaining(), 0);
        prop_assert_eq!(dma.outstanding(), 0);
    }
}
