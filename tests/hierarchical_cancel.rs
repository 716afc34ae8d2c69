//! End-to-end: closing a parent `CloseSignal` cascades through several
//! generations of children within a tight deadline, each reporting the
//! parent's reason and a non-timeout cancellation.

use std::time::Duration;

use cfgo_client::CloseSignal;

#[tokio::test]
async fn closing_parent_cascades_to_every_descendant() {
    let parent = CloseSignal::new();

    let mut grandchildren = Vec::new();
    for _ in 0..5 {
        let child = parent.create_child();
        for _ in 0..5 {
            grandchildren.push(child.create_child());
        }
    }
    assert_eq!(grandchildren.len(), 25);

    parent.close("root shutdown");

    tokio::time::sleep(Duration::from_millis(100)).await;

    for descendant in &grandchildren {
        assert!(descendant.is_closed());
        assert!(!descendant.is_timeout());
        assert_eq!(descendant.reason(), "root shutdown");
    }
}

#[tokio::test]
async fn timeout_propagates_as_timeout_not_plain_cancel() {
    let parent = CloseSignal::new();
    parent.set_timeout(Duration::from_millis(20), "deadline exceeded");
    let child = parent.create_child();

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(parent.is_closed());
    assert!(parent.is_timeout());
    assert!(child.is_closed());
    assert!(child.is_timeout());
}
