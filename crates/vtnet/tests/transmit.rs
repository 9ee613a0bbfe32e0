mod common;

use std::sync::Arc;

use common::{
    registry_with, wait_for, Harness, MemoryTouchingBackend, RecordingBackend, BUF_BASE, QUEUE_SIZE,
    TOUCH_ADDR,
};
use vtnet::VTNET_TXQ;
use vtnet_backend::{BackendRegistry, LoopbackBackend};
use vtnet_virtio::queue::{VIRTQ_DESC_F_NEXT, VRING_USED_F_NO_NOTIFY};
use vtnet_virtio::VirtioDevice;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

#[test]
fn three_segment_frame_is_sent_once_and_completed() {
    let mut h = Harness::new();
    let backend = Arc::new(RecordingBackend::new(true));
    let dev = h.attach("rec", &registry_with("rec", backend.clone()));

    let frame = pattern(1514, 3);
    let segments = [(BUF_BASE, 514u32), (BUF_BASE + 0x1000, 500), (BUF_BASE + 0x2000, 500)];
    let mut offset = 0;
    for &(addr, len) in &segments {
        let len = len as usize;
        h.mem.write(addr, &frame[offset..offset + len]).unwrap();
        offset += len;
    }
    let head = h.tx.add_chain(&segments, false);

    dev.notify(VTNET_TXQ);
    wait_for("tx completion", || h.tx.used_idx() == 1);
    wait_for("tx interrupt", || h.tx_interrupts() == 1);

    assert_eq!(backend.sent(), vec![frame]);
    assert_eq!(h.tx.used_elem(0), (u32::from(head), 1514));
    assert_eq!(h.rx_interrupts(), 0);
}

#[test]
fn idle_worker_leaves_notifications_enabled() {
    let mut h = Harness::new();
    let backend = Arc::new(RecordingBackend::new(true));
    let dev = h.attach("rec", &registry_with("rec", backend.clone()));

    h.tx.add_chain(&[(BUF_BASE, 64)], false);
    dev.notify(VTNET_TXQ);
    wait_for("tx completion", || h.tx.used_idx() == 1);
    wait_for("notifications re-enabled", || {
        h.tx.used_flags() & VRING_USED_F_NO_NOTIFY == 0
    });

    // A second kick after going idle is still picked up.
    h.tx.add_chain(&[(BUF_BASE + 0x1000, 80)], false);
    dev.notify(VTNET_TXQ);
    wait_for("second completion", || h.tx.used_idx() == 2);
    assert_eq!(backend.sent().len(), 2);
}

#[test]
fn header_is_stripped_for_plain_transports() {
    let mut h = Harness::new();
    let (dev, lo) = h.attach_loopback();
    dev.apply_negotiated_features(0);

    let payload = pattern(60, 9);
    h.mem.write(BUF_BASE, &[0; 10]).unwrap();
    h.mem.write(BUF_BASE + 0x100, &payload).unwrap();
    h.tx.add_chain(&[(BUF_BASE, 10), (BUF_BASE + 0x100, 60)], false);

    dev.notify(VTNET_TXQ);
    wait_for("tx completion", || h.tx.used_idx() == 1);

    assert_eq!(lo.take_sent(), vec![payload]);
    assert_eq!(h.tx.used_elem(0).1, 70);
}

#[test]
fn header_only_chain_is_completed_without_a_send() {
    let mut h = Harness::new();
    let (dev, lo) = h.attach_loopback();

    h.tx.add_chain(&[(BUF_BASE, 12)], false);
    dev.notify(VTNET_TXQ);
    wait_for("tx completion", || h.tx.used_idx() == 1);

    assert!(lo.take_sent().is_empty());
    assert_eq!(h.tx.used_elem(0).1, 12);
}

#[test]
fn concurrent_kicks_never_overlap_sends() {
    let mut h = Harness::new();
    let backend = Arc::new(RecordingBackend::new(true));
    let dev = h.attach("rec", &registry_with("rec", backend.clone()));

    let chains = QUEUE_SIZE - 4;
    for i in 0..chains {
        h.tx.add_chain(&[(BUF_BASE + u64::from(i) * 0x800, 128)], false);
    }

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    dev.notify(VTNET_TXQ);
                }
            });
        }
    });

    wait_for("all chains completed", || h.tx.used_idx() == chains);
    assert_eq!(backend.sent().len(), usize::from(chains));
    assert_eq!(backend.max_active(), 1);
}

#[test]
fn link_down_still_completes_transmit_chains() {
    let mut h = Harness::new();
    let dev = h.attach("tap0", &BackendRegistry::new());
    assert!(!dev.link_up());

    h.tx.add_chain(&[(BUF_BASE, 100), (BUF_BASE + 0x100, 200)], false);
    dev.notify(VTNET_TXQ);

    wait_for("tx completion", || h.tx.used_idx() == 1);
    assert_eq!(h.tx.used_elem(0).1, 300);
}

#[test]
fn reflecting_loopback_returns_frames_to_the_guest() {
    let mut h = Harness::new();
    let backend = Arc::new(LoopbackBackend::reflecting());
    let dev = h.attach("lo0", &registry_with("lo", backend.clone()));
    dev.apply_negotiated_features(0);

    h.rx.add_chain(&[(BUF_BASE + 0x8000, 2048)], true);
    dev.notify(vtnet::VTNET_RXQ);

    let payload = pattern(64, 1);
    h.mem.write(BUF_BASE, &[0; 10]).unwrap();
    h.mem.write(BUF_BASE + 10, &payload).unwrap();
    h.tx.add_chain(&[(BUF_BASE, 74)], false);
    dev.notify(VTNET_TXQ);

    wait_for("frame reflected", || h.rx.used_idx() == 1);
    assert_eq!(h.rx.used_elem(0).1, 74);
    assert_eq!(h.read(BUF_BASE + 0x8000 + 10, 64), payload);
}

#[test]
fn transport_may_reenter_guest_memory_from_send() {
    let mut h = Harness::new();
    let backend = Arc::new(MemoryTouchingBackend::new(h.mem.clone()));
    let dev = h.attach("touch", &registry_with("touch", backend.clone()));
    dev.apply_negotiated_features(0);

    h.rx.add_chain(&[(BUF_BASE + 0x8000, 2048)], true);
    dev.notify(vtnet::VTNET_RXQ);

    let payload = pattern(100, 5);
    h.mem.write(BUF_BASE, &[0; 10]).unwrap();
    h.mem.write(BUF_BASE + 10, &payload).unwrap();
    h.tx.add_chain(&[(BUF_BASE, 110)], false);
    dev.notify(VTNET_TXQ);

    // The reflected frame is received on the worker thread, from inside `send`.
    wait_for("tx completion", || h.tx.used_idx() == 1);
    wait_for("frame reflected", || h.rx.used_idx() == 1);
    assert_eq!(backend.take_sent(), vec![payload.clone()]);
    assert_eq!(h.read(BUF_BASE + 0x8000 + 10, 100), payload);
    assert_eq!(h.read(TOUCH_ADDR, 1), vec![0x52]);
}

#[test]
fn descriptor_loop_halts_the_device() {
    let h = Harness::new();
    let backend = Arc::new(RecordingBackend::new(true));
    let dev = h.attach("rec", &registry_with("rec", backend.clone()));

    h.tx.write_desc(0, BUF_BASE, 64, VIRTQ_DESC_F_NEXT, 1);
    h.tx.write_desc(1, BUF_BASE + 0x100, 64, VIRTQ_DESC_F_NEXT, 0);
    h.tx.publish(0);
    dev.notify(VTNET_TXQ);

    wait_for("device halted", || dev.needs_reset());
    assert_eq!(h.tx.used_idx(), 0);
    assert!(backend.sent().is_empty());

    dev.reset();
    assert!(!dev.needs_reset());
}
