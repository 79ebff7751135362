// tests/integration/ordering_test.rs

//! Tests of the invoke-order manager: monotonic sequence assignment,
//! out-of-order completion buffering, and kill-signal cleanup.

use stratus::core::ordering::InvokeOrderManager;
use stratus::core::signal;

#[test]
fn test_sequences_are_monotonic_per_instance() {
    let mgr = InvokeOrderManager::new();
    mgr.register_instance("ins");
    assert_eq!(mgr.assign_seq("ins", false), Some(0));
    assert_eq!(mgr.assign_seq("ins", false), Some(1));
    assert_eq!(mgr.assign_seq("ins", false), Some(2));
    // Unregistered instances get no sequence unless asked to register.
    assert_eq!(mgr.assign_seq("other", false), None);
    assert_eq!(mgr.assign_seq("other", true), Some(0));
}

#[test]
fn test_out_of_order_completions_buffer_until_contiguous() {
    let mgr = InvokeOrderManager::new();
    mgr.register_instance("ins");
    let v1 = mgr.assign_seq("ins", false).unwrap();
    let v2 = mgr.assign_seq("ins", false).unwrap();
    let v3 = mgr.assign_seq("ins", false).unwrap();
    assert_eq!((v1, v2, v3), (0, 1, 2));

    // Completions arrive as v2, v3, v1.
    mgr.notify_invoke_success("ins", v2);
    assert_eq!(mgr.unfinished_seq("ins"), Some(0));
    mgr.notify_invoke_success("ins", v3);
    assert_eq!(mgr.unfinished_seq("ins"), Some(0));
    mgr.notify_invoke_success("ins", v1);
    // The buffered completions drain in one slide.
    assert_eq!(mgr.unfinished_seq("ins"), Some(3));
}

#[test]
fn test_create_consumes_sequence_zero() {
    let mgr = InvokeOrderManager::new();
    assert_eq!(mgr.create_instance("ins"), Some(0));
    // Re-registration does not consume another slot.
    assert_eq!(mgr.create_instance("ins"), None);
    assert_eq!(mgr.assign_seq("ins", false), Some(1));
}

#[test]
fn test_kill_signals_drop_ordering_state() {
    let mgr = InvokeOrderManager::new();
    mgr.register_instance("a");
    mgr.register_instance("b");

    mgr.clear_on_signal("a", signal::KILL_INSTANCE);
    assert_eq!(mgr.unfinished_seq("a"), None);
    assert_eq!(mgr.unfinished_seq("b"), Some(0));

    mgr.clear_on_signal("", signal::KILL_ALL_INSTANCES);
    assert_eq!(mgr.tracked_instances(), 0);
}

#[test]
fn test_unrelated_signal_keeps_state() {
    let mgr = InvokeOrderManager::new();
    mgr.register_instance("a");
    mgr.clear_on_signal("a", signal::SHUT_DOWN_SIGNAL);
    assert_eq!(mgr.unfinished_seq("a"), Some(0));
}
