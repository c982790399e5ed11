//! Transmit reconciliation against the simulated NIC.

use std::sync::Arc;

use netmap::{
    Adapter, AdapterConfig, BufIdx, BufferPool, DeviceError, Error, QueueId, ReinitReason,
    RingState, SimConfig, SimulatedNic, SlotFlags, TxCommand,
};
use proptest::prelude::*;

const N: usize = 8;

fn open() -> Arc<Adapter<SimulatedNic>> {
    let pool = Arc::new(BufferPool::new(64, 2048).unwrap());
    let nic = Arc::new(SimulatedNic::new(SimConfig::new("sim0", 1, N), pool.clone()));
    Adapter::open(nic, pool, AdapterConfig::new(1, N)).unwrap()
}

fn writes(adapter: &Adapter<SimulatedNic>) -> u64 {
    adapter
        .device()
        .stats(QueueId::tx(0))
        .unwrap()
        .descriptor_writes
}

#[test]
fn test_publish_three_then_complete() {
    let adapter = open();
    let mut tx = adapter.lock_tx(0).unwrap();
    assert_eq!(tx.avail(), N - 1);

    for _ in 0..3 {
        assert!(tx.push(&[0x5A; 60]));
    }
    tx.sync().unwrap();
    assert_eq!(tx.avail(), 4);
    assert_eq!(tx.ring().hw_cur(), 3);
    assert_eq!(writes(&adapter), 3);
    assert_eq!(adapter.device().tail(QueueId::tx(0)), Some(3));

    assert_eq!(adapter.device().complete_tx(0, 3), 3);
    tx.sync().unwrap();
    assert_eq!(tx.avail(), N - 1);
    assert_eq!(tx.next_to_clean(), 3);
}

#[test]
fn test_unmapped_handle_commits_prefix() {
    let adapter = open();
    {
        let mut tx = adapter.lock_tx(0).unwrap();
        for _ in 0..5 {
            tx.push(&[1u8; 60]);
        }
        tx.ring_mut().slot_mut(2).buf_idx = BufIdx::RESERVED;
        let err = tx.sync().unwrap_err();
        assert_eq!(
            err.reason,
            ReinitReason::InvalidBuffer {
                slot: 2,
                buf: BufIdx::RESERVED
            }
        );
        assert_eq!(tx.ring().hw_cur(), 2);
        assert_eq!(tx.state(), RingState::NeedsReinit);
        assert!(tx.ring().reinit_requested());
    }
    assert_eq!(writes(&adapter), 2);
    assert_eq!(adapter.device().tail(QueueId::tx(0)), Some(2));

    // Fails fast until reinitialized, without touching the device.
    let err = adapter.sync_transmit(0, 5).unwrap_err();
    match err {
        Error::Reinit(e) => assert_eq!(e.reason, ReinitReason::ReinitPending),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(writes(&adapter), 2);

    let report = adapter.reinitialize_tx(0).unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!((report.hw_cur, report.avail), (2, 5));

    let mut tx = adapter.lock_tx(0).unwrap();
    assert_ne!(tx.ring().slot(2).buf_idx, BufIdx::RESERVED);
    assert_eq!(tx.cur(), 2);
    // The remaining three slots still hold their frames.
    tx.ring_mut().advance(3);
    tx.sync().unwrap();
    assert_eq!(tx.ring().hw_cur(), 5);
    assert_eq!(writes(&adapter), 5);
}

#[test]
fn test_explicit_cursor_moves_consumer_cursor() {
    let adapter = open();
    {
        let mut tx = adapter.lock_tx(0).unwrap();
        for i in 0..3 {
            tx.ring_mut().slot_mut(i).len = 60;
        }
    }
    adapter.sync_transmit(0, 3).unwrap();

    let mut tx = adapter.lock_tx(0).unwrap();
    assert_eq!((tx.ring().hw_cur(), tx.cur(), tx.avail()), (3, 3, 4));
    assert!(tx.push(&[0x11; 60]));
    tx.sync().unwrap();
    assert_eq!(tx.state(), RingState::Active);
    assert_eq!((tx.ring().hw_cur(), tx.cur(), tx.avail()), (4, 4, 3));
    assert_eq!(writes(&adapter), 4);
}

#[test]
fn test_bind_failure_commits_prefix() {
    let adapter = open();
    let nic = adapter.device().clone();
    let spare = adapter.pool().alloc().unwrap();
    let old = {
        let mut tx = adapter.lock_tx(0).unwrap();
        for _ in 0..4 {
            tx.push(&[2u8; 60]);
        }
        let old = tx.ring().slot(1).buf_idx;
        tx.ring_mut().slot_mut(1).set_buffer(spare);
        nic.fail_next_bind(QueueId::tx(0));

        let err = tx.sync().unwrap_err();
        assert!(matches!(
            err.reason,
            ReinitReason::Device(DeviceError::BindFailed { index: 1, .. })
        ));
        assert_eq!((tx.ring().hw_cur(), tx.cur(), tx.avail()), (1, 1, 6));
        assert_eq!(tx.state(), RingState::NeedsReinit);
        old
    };
    assert_eq!(writes(&adapter), 1);
    assert_eq!(nic.tail(QueueId::tx(0)), Some(1));

    let report = adapter.reinitialize_tx(0).unwrap();
    assert_eq!((report.hw_cur, report.avail), (1, 6));
    assert!(!report.queue_reset);

    // The swap is retried on the next sync and goes through.
    let mut tx = adapter.lock_tx(0).unwrap();
    tx.ring_mut().advance(3);
    tx.sync().unwrap();
    assert_eq!(tx.ring().hw_cur(), 4);
    assert_eq!(tx.ring().bound(1), spare);
    let desc = nic.tx_descriptor(0, 1).unwrap();
    assert_eq!(desc.addr, Some(adapter.pool().map(spare).unwrap()));
    adapter.pool().free(old).unwrap();
}

#[test]
fn test_unresponsive_device_needs_reinit() {
    let adapter = open();
    let nic = adapter.device().clone();
    {
        let mut tx = adapter.lock_tx(0).unwrap();
        tx.push(&[3u8; 60]);
        tx.push(&[3u8; 60]);
        tx.sync().unwrap();

        nic.set_not_responding(true);
        tx.push(&[3u8; 60]);
        let err = tx.sync().unwrap_err();
        assert_eq!(err.reason, ReinitReason::Device(DeviceError::NotResponding));
        assert_eq!(tx.state(), RingState::NeedsReinit);
        assert_eq!(tx.ring().hw_cur(), 2);
    }
    assert_eq!(writes(&adapter), 2);

    // The head cannot be read and the queue cannot be reset either.
    match adapter.reinitialize_tx(0).unwrap_err() {
        Error::Reinit(e) => {
            assert_eq!(e.reason, ReinitReason::Device(DeviceError::NotResponding))
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(adapter.lock_tx(0).unwrap().state(), RingState::NeedsReinit);

    nic.set_not_responding(false);
    let report = adapter.reinitialize_tx(0).unwrap();
    assert_eq!((report.hw_cur, report.avail), (2, 5));
    assert!(!report.queue_reset);

    let mut tx = adapter.lock_tx(0).unwrap();
    assert!(tx.push(&[4u8; 60]));
    tx.sync().unwrap();
    assert_eq!(tx.ring().hw_cur(), 3);
    assert_eq!(writes(&adapter), 3);
}

#[test]
fn test_cursor_at_hw_cur_writes_nothing() {
    let adapter = open();
    adapter.sync_transmit(0, 0).unwrap();
    assert_eq!(writes(&adapter), 0);
    assert_eq!(adapter.device().tail(QueueId::tx(0)), Some(0));
}

#[test]
fn test_cursor_out_of_range() {
    let adapter = open();
    let err = adapter.sync_transmit(0, N).unwrap_err();
    match err {
        Error::Reinit(e) => {
            assert_eq!(e.reason, ReinitReason::CursorOutOfRange { cursor: N, limit: N - 1 })
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(writes(&adapter), 0);
}

#[test]
fn test_span_beyond_avail_is_rejected() {
    let adapter = open();
    let mut tx = adapter.lock_tx(0).unwrap();
    for _ in 0..6 {
        tx.push(&[0u8; 60]);
    }
    tx.sync().unwrap();
    // One slot owned; asking for three is a protocol error.
    let err = tx.sync_to(1).unwrap_err();
    assert_eq!(err.reason, ReinitReason::SpanExceedsAvail { span: 3, avail: 1 });
    assert_eq!(writes(&adapter), 6);
}

#[test]
fn test_reclaim_is_idempotent() {
    let adapter = open();
    let mut tx = adapter.lock_tx(0).unwrap();
    for _ in 0..3 {
        tx.push(&[0u8; 60]);
    }
    tx.sync().unwrap();
    let before = (tx.avail(), tx.ring().hw_cur(), tx.next_to_clean());
    tx.sync().unwrap();
    tx.sync().unwrap();
    assert_eq!(before, (tx.avail(), tx.ring().hw_cur(), tx.next_to_clean()));
}

#[test]
fn test_round_trip_keeps_handle_and_payload() {
    let adapter = open();
    let mut tx = adapter.lock_tx(0).unwrap();
    let handle = tx.ring().slot(0).buf_idx;
    tx.push(&[0xC3; 100]);
    tx.ring_mut().slot_mut(0).request_report();
    tx.sync().unwrap();

    let desc = adapter.device().tx_descriptor(0, 0).unwrap();
    assert!(desc.cmd.contains(TxCommand::RS | TxCommand::EOP | TxCommand::IFCS));
    assert_eq!(desc.len, 100);

    adapter.device().complete_tx(0, 1);
    tx.sync().unwrap();
    let slot = *tx.ring().slot(0);
    assert_eq!(slot.buf_idx, handle);
    assert!(!slot.flags.contains(SlotFlags::REPORT));
    assert_eq!(slot.len, 100);
    let payload = unsafe { adapter.pool().buffer(handle).unwrap() };
    assert!(payload[..100].iter().all(|&b| b == 0xC3));
}

#[test]
fn test_hw_cur_is_monotonic() {
    let adapter = open();
    let mut tx = adapter.lock_tx(0).unwrap();
    let mut prev = tx.ring().hw_cur();
    for round in 0..40 {
        let want = round % 4 + 1;
        let mut pushed = 0;
        while pushed < want && tx.push(&[0u8; 60]) {
            pushed += 1;
        }
        tx.sync().unwrap();
        let now = tx.ring().hw_cur();
        assert_eq!(tx.ring().distance(prev, now), pushed);
        prev = now;
        adapter.device().complete_tx(0, 2);
    }
}

#[test]
fn test_sync_after_close_is_rejected() {
    let adapter = open();
    adapter.close().unwrap();
    assert!(matches!(
        adapter.sync_transmit(0, 0),
        Err(Error::Adapter(netmap::AdapterError::NotActive))
    ));
    assert_eq!(adapter.pool().in_use(), 0);
}

#[derive(Debug, Clone)]
enum Op {
    Publish(usize),
    Complete(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..N).prop_map(Op::Publish),
        (0usize..N).prop_map(Op::Complete),
    ]
}

proptest! {
    #[test]
    fn prop_avail_tracks_in_flight(ops in prop::collection::vec(op(), 1..60)) {
        let adapter = open();
        let nic = adapter.device().clone();
        let mut tx = adapter.lock_tx(0).unwrap();

        for op in ops {
            match op {
                Op::Publish(k) => {
                    for _ in 0..k {
                        tx.push(&[0u8; 60]);
                    }
                }
                Op::Complete(k) => {
                    nic.complete_tx(0, k);
                }
            }
            tx.sync().unwrap();
            let in_flight = nic.tx_pending(0);
            prop_assert!(tx.avail() <= N - 1);
            prop_assert_eq!(tx.avail(), N - 1 - in_flight);
        }
    }
}
