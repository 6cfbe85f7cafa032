mod common;
use common::*;
use decnet_r::nsp::defs::FlowGate;
use decnet_r::nsp::input::{seq_after, seq_next, PendingMsg, SendQueueEntry};

const REMOTE_PORT: u16 = 0x0101;

#[test]
fn in_order_data_with_piggyback_ack() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    with_conn(&stack, id, |c| {
        c.data.num_rcv = 5;
        c.data.ack_rcv = 9;
        for n in 10..=20 {
            c.data.xmit_queue.push_back(SendQueueEntry {
                segnum: n,
                payload: vec![0; 8],
            });
        }
    });

    // One ack word: present, data subchannel, value 0x010.
    inject(
        &stack,
        data_message(local, REMOTE_PORT, &[0x8010], 6, &[0xaa; 100]),
    );

    with_conn(&stack, id, |c| {
        assert_eq!(c.data.ack_rcv, 0x010);
        assert_eq!(
            c.data.xmit_queue.front().map(|e| e.segnum),
            Some(17),
            "segments up to the acked mark must be released"
        );
        assert_eq!(c.data.num_rcv, 6);
        assert_eq!(c.data_receive_queue.len(), 1);
        assert_eq!(c.data_receive_queue[0].payload().len(), 100);
        assert!(c.timer.ack_delay.is_some(), "ack should be delayed");
    });
    assert!(drain(&rx).is_empty(), "a delayed ack must not go out at once");
}

#[test]
fn cross_subchannel_ack_on_other_data() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    // The carrying message is other-data, so the other-subchannel bit is
    // flipped on the way in and the ack lands on the data subchannel.
    inject(
        &stack,
        oth_message(local, REMOTE_PORT, &[0xa020], 1, b"interrupt"),
    );

    with_conn(&stack, id, |c| {
        assert_eq!(c.data.ack_rcv, 0x020);
        assert_eq!(c.other.ack_rcv, 0, "the other subchannel must not move");
        assert_eq!(c.other.num_rcv, 1);
        assert_eq!(c.other_receive_queue.len(), 1);
    });
    let out = drain(&rx);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_wire()[0], 0x14, "other-data always gets an ack");
}

#[test]
fn own_ack_of_other_data_lands_on_other_subchannel() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    // No subchannel bits in the word; the cross flip makes it an
    // other-data ack because the carrier is other-data class.
    inject(&stack, oth_message(local, REMOTE_PORT, &[0x8005], 1, b"x"));

    with_conn(&stack, id, |c| {
        assert_eq!(c.other.ack_rcv, 0x005);
        assert_eq!(c.data.ack_rcv, 0);
    });
    drain(&rx);
}

#[test]
fn duplicate_data_segment_still_acked() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    inject(&stack, data_message(local, REMOTE_PORT, &[], 1, b"first"));
    with_conn(&stack, id, |c| {
        assert_eq!(c.data.num_rcv, 1);
        assert_eq!(c.data_receive_queue.len(), 1);
    });
    drain(&rx);

    // Re-delivery of the segment we already accepted.
    inject(&stack, data_message(local, REMOTE_PORT, &[], 1, b"first"));

    with_conn(&stack, id, |c| {
        assert_eq!(c.data.num_rcv, 1, "counter must not move");
        assert_eq!(c.data_receive_queue.len(), 1, "queue must not grow");
    });
    let out = drain(&rx);
    assert_eq!(out.len(), 1);
    let wire = out[0].as_wire();
    assert_eq!(wire[0], 0x04);
    assert_eq!(u16::from_le_bytes([wire[5], wire[6]]), 0x8000 | 1);
}

#[test]
fn out_of_sequence_data_dropped_and_acked() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    inject(&stack, data_message(local, REMOTE_PORT, &[], 3, b"early"));

    with_conn(&stack, id, |c| {
        assert_eq!(c.data.num_rcv, 0);
        assert!(c.data_receive_queue.is_empty());
    });
    let out = drain(&rx);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_wire()[0], 0x04);
}

#[test]
fn explicit_ack_request_bypasses_delay() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    inject(
        &stack,
        data_message(local, REMOTE_PORT, &[], 0x1001, b"ack me now"),
    );

    with_conn(&stack, id, |c| {
        assert_eq!(c.data.num_rcv, 1);
        assert!(c.timer.ack_delay.is_none());
        assert_eq!(c.ackxmt_dat, 1);
    });
    let out = drain(&rx);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_wire()[0], 0x04);
}

#[test]
fn stale_ack_does_not_move_the_watermark() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    inject(&stack, bare_ack_message(local, REMOTE_PORT, 0x8010));
    with_conn(&stack, id, |c| assert_eq!(c.data.ack_rcv, 0x010));

    inject(&stack, bare_ack_message(local, REMOTE_PORT, 0x8005));
    with_conn(&stack, id, |c| {
        assert_eq!(c.data.ack_rcv, 0x010, "acks are monotone");
    });
    drain(&rx);
}

#[test]
fn nak_words_are_consumed_but_ignored() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    // First word is a NAK, second word a genuine ack; the payload still
    // starts after both.
    inject(
        &stack,
        data_message(local, REMOTE_PORT, &[0xc008, 0x8004], 1, b"pay"),
    );

    with_conn(&stack, id, |c| {
        assert_eq!(c.data.ack_rcv, 0x004);
        assert_eq!(c.data.num_rcv, 1);
        assert_eq!(c.data_receive_queue[0].payload(), b"pay");
    });
    drain(&rx);
}

#[test]
fn sequence_helpers_cover_the_wrap_boundary() {
    assert!(seq_next(0xfff, 0x000));
    assert!(!seq_next(0xfff, 0x001));
    assert!(!seq_next(0x005, 0x005));

    assert!(seq_after(0x000, 0xfff));
    assert!(!seq_after(0xfff, 0x000));
    assert!(!seq_after(0x123, 0x123));
    // Exactly half the space apart is not "after".
    assert!(!seq_after(0xc00, 0x400));
}

#[test]
fn receive_counter_wraps_with_the_sequence_space() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    with_conn(&stack, id, |c| {
        c.data.num_rcv = 0xfff;
        c.data.ack_rcv = 0xffe;
    });

    inject(&stack, data_message(local, REMOTE_PORT, &[0x8001], 0, b"wrap"));

    with_conn(&stack, id, |c| {
        assert_eq!(c.data.num_rcv, 0x000);
        assert_eq!(c.data.ack_rcv, 0x001);
        assert_eq!(c.data_receive_queue.len(), 1);
    });
    drain(&rx);
}

#[test]
fn buffer_exhaustion_drops_without_advancing() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    with_conn(&stack, id, |c| c.rcvbuf = 10);

    // The first segment fits the (empty) budget and congests the link.
    inject(&stack, data_message(local, REMOTE_PORT, &[], 1, b"one"));
    with_conn(&stack, id, |c| {
        assert_eq!(c.data.num_rcv, 1);
        assert_eq!(c.flowloc_sw, FlowGate::DontSend);
        assert_eq!(c.pending, Some(PendingMsg::FlowSwitch));
    });
    drain(&rx);

    // The gating link service is emitted from user/timer context.
    stack.flush_pending(id).unwrap();
    let out = drain(&rx);
    assert_eq!(out.len(), 1);
    let wire = out[0].as_wire();
    assert_eq!(wire[0], 0x10);
    assert_eq!(wire[7], 0x01, "DONTSEND gate");

    // The second segment finds the budget exhausted.
    inject(&stack, data_message(local, REMOTE_PORT, &[], 2, b"two"));
    with_conn(&stack, id, |c| {
        assert_eq!(c.data.num_rcv, 1, "sequence must not advance on a drop");
        assert_eq!(c.drops, 1);
        assert_eq!(c.data_receive_queue.len(), 1);
    });
    let out = drain(&rx);
    assert_eq!(out.len(), 1, "the drop is still acked at the old mark");
    assert_eq!(out[0].as_wire()[0], 0x04);
}

#[test]
fn recv_releases_budget_and_reopens_flow() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);
    with_conn(&stack, id, |c| c.rcvbuf = 10);

    inject(&stack, data_message(local, REMOTE_PORT, &[], 1, b"hello"));
    with_conn(&stack, id, |c| assert_eq!(c.flowloc_sw, FlowGate::DontSend));
    drain(&rx);

    let payload = stack.recv(id).unwrap();
    assert_eq!(payload, b"hello");
    with_conn(&stack, id, |c| {
        assert_eq!(c.rmem_alloc, 0);
        assert_eq!(c.flowloc_sw, FlowGate::Send);
        assert_eq!(c.pending, Some(PendingMsg::FlowSwitch));
    });
}

#[test]
fn link_service_gates_and_reopens_the_sender() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    inject(&stack, ls_message(local, REMOTE_PORT, 1, 0x01, 0));
    with_conn(&stack, id, |c| {
        assert_eq!(c.flowrem_sw, FlowGate::DontSend);
        assert_eq!(c.other.num_rcv, 1);
    });
    let out = drain(&rx);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_wire()[0], 0x14, "link service gets an other-data ack");

    inject(&stack, ls_message(local, REMOTE_PORT, 2, 0x02, 0));
    with_conn(&stack, id, |c| {
        assert_eq!(c.flowrem_sw, FlowGate::Send);
        assert_eq!(c.other.num_rcv, 2);
    });
    drain(&rx);
}

#[test]
fn link_service_with_bad_flags_is_ignored() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    inject(&stack, ls_message(local, REMOTE_PORT, 1, 0x09, 0));

    with_conn(&stack, id, |c| {
        assert_eq!(c.other.num_rcv, 0);
        assert_eq!(c.flowrem_sw, FlowGate::Send);
    });
    assert!(drain(&rx).is_empty());
}

#[test]
fn link_service_request_counts_adjust_the_data_window() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    with_conn(&stack, id, |c| {
        c.services_rem = 0x05; // segment flow control
        c.data.flow_remote = 5;
    });

    inject(&stack, ls_message(local, REMOTE_PORT, 1, 0x00, -2));
    with_conn(&stack, id, |c| assert_eq!(c.data.flow_remote, 3));

    inject(&stack, ls_message(local, REMOTE_PORT, 2, 0x00, 4));
    with_conn(&stack, id, |c| assert_eq!(c.data.flow_remote, 7));
    drain(&rx);
}

#[test]
fn link_service_interrupt_grant_raises_the_other_window() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    inject(&stack, ls_message(local, REMOTE_PORT, 1, 0x04, 2));

    with_conn(&stack, id, |c| {
        assert_eq!(c.other.flow_remote, 2);
        assert_eq!(c.other.num_rcv, 1);
    });
    drain(&rx);
}

#[test]
fn out_of_sequence_link_service_changes_nothing_but_still_acks() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    inject(&stack, ls_message(local, REMOTE_PORT, 5, 0x01, 0));

    with_conn(&stack, id, |c| {
        assert_eq!(c.other.num_rcv, 0);
        assert_eq!(c.flowrem_sw, FlowGate::Send);
    });
    let out = drain(&rx);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].as_wire()[0], 0x14);
}

#[test]
fn other_data_delivery_and_recv() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    inject(&stack, oth_message(local, REMOTE_PORT, &[], 1, b"attention"));
    drain(&rx);

    let payload = stack.recv_other(id).unwrap();
    assert_eq!(payload, b"attention");
    with_conn(&stack, id, |c| assert_eq!(c.other.num_rcv, 1));
}

#[test]
fn user_lock_parks_segments_on_the_backlog() {
    let (stack, rx) = setup_stack();
    let (id, local) = run_connection(&stack, &rx, REMOTE_PORT);

    stack.lock_user(id).unwrap();
    inject(&stack, data_message(local, REMOTE_PORT, &[], 1, b"parked"));

    with_conn(&stack, id, |c| {
        assert_eq!(c.backlog.len(), 1);
        assert!(c.data_receive_queue.is_empty());
        assert_eq!(c.data.num_rcv, 0);
    });

    stack.unlock_user(id).unwrap();

    with_conn(&stack, id, |c| {
        assert!(c.backlog.is_empty());
        assert_eq!(c.data.num_rcv, 1);
        assert_eq!(c.data_receive_queue.len(), 1);
    });
    drain(&rx);
}
