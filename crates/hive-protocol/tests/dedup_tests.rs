use std::time::Duration;

use chrono::Utc;
use hive_protocol::dedup::DeliveryWindow;
use hive_protocol::ProtocolError;

#[test]
fn test_fresh_id_accepted() {
    let mut w = DeliveryWindow::new();
    assert!(w.check_and_insert("msg-abc", Utc::now()).is_ok());
}

#[test]
fn test_duplicate_rejected() {
    let mut w = DeliveryWindow::new();
    let now = Utc::now();
    w.check_and_insert("msg-abc", now).unwrap();
    let again = w.check_and_insert("msg-abc", now);
    assert!(matches!(again, Err(ProtocolError::Duplicate(id)) if id == "msg-abc"));
}

#[test]
fn test_different_ids_accepted() {
    let mut w = DeliveryWindow::new();
    let now = Utc::now();
    assert!(w.check_and_insert("msg-1", now).is_ok());
    assert!(w.check_and_insert("msg-2", now).is_ok());
    assert!(w.check_and_insert("msg-3", now).is_ok());
    assert_eq!(w.size(), 3);
}

#[test]
fn test_ids_evicted_after_window() {
    let mut w = DeliveryWindow::with_window(Duration::from_secs(60));
    let start = Utc::now();
    w.check_and_insert("msg-old", start).unwrap();

    let later = start + chrono::Duration::seconds(61);
    assert!(w.check_and_insert("msg-new", later).is_ok());
    assert_eq!(w.size(), 1, "old id must be evicted");
    assert!(w.check_and_insert("msg-old", later).is_ok());
}
