//! Rotation order, wrap detection, and reload semantics.

use sealpost::ring::{load_messages, parse_messages, MessageRing, RingError};

fn ring(items: &[&str]) -> MessageRing {
    MessageRing::new(items.iter().map(|s| (*s).to_owned()).collect()).expect("non-empty ring")
}

#[test]
fn empty_ring_is_rejected() {
    let result = MessageRing::new(Vec::new());
    assert!(matches!(result, Err(RingError::EmptyRing)));
}

#[test]
fn rotates_in_order_and_reports_wrap() {
    let mut ring = ring(&["a", "b", "c"]);

    assert_eq!(ring.next(), ("a", false));
    assert!(!ring.advance());
    assert_eq!(ring.next(), ("b", false));
    assert!(!ring.advance());
    assert_eq!(ring.next(), ("c", true));
    assert!(ring.advance());
    assert_eq!(ring.cursor(), 0);
    assert_eq!(ring.next(), ("a", false));
}

#[test]
fn next_does_not_move_cursor() {
    let ring = ring(&["a", "b"]);
    assert_eq!(ring.next().0, "a");
    assert_eq!(ring.next().0, "a");
    assert_eq!(ring.cursor(), 0);
}

#[test]
fn single_item_ring_wraps_on_every_advance() {
    let mut ring = ring(&["only"]);
    for _ in 0..3 {
        assert_eq!(ring.next(), ("only", true));
        assert!(ring.advance());
        assert_eq!(ring.cursor(), 0);
    }
}

#[test]
fn reload_replaces_items_and_rewinds() {
    let mut ring = ring(&["a", "b", "c"]);
    ring.advance();
    ring.advance();

    ring.reload(vec!["x".to_owned(), "y".to_owned()])
        .expect("reload should succeed");
    assert_eq!(ring.len(), 2);
    assert_eq!(ring.cursor(), 0);
    assert_eq!(ring.next(), ("x", false));
}

#[test]
fn empty_reload_leaves_ring_untouched() {
    let mut ring = ring(&["a", "b"]);
    ring.advance();

    let result = ring.reload(Vec::new());
    assert!(matches!(result, Err(RingError::EmptyRing)));
    assert_eq!(ring.len(), 2);
    assert_eq!(ring.cursor(), 1);
}

#[test]
fn parse_messages_skips_blank_and_comment_lines() {
    let text = "# greeting list\n\n  hello  \n\t\nsecond line\n# trailing\n";
    assert_eq!(parse_messages(text), vec!["hello", "second line"]);
}

#[test]
fn load_messages_reads_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("messages.txt");
    std::fs::write(&path, "one\ntwo\n").expect("should write");

    let items = load_messages(&path).expect("should load");
    assert_eq!(items, vec!["one", "two"]);
}

#[test]
fn load_messages_rejects_blank_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("messages.txt");
    std::fs::write(&path, "\n\n# nothing here\n").expect("should write");

    assert!(matches!(load_messages(&path), Err(RingError::EmptyRing)));
}

#[test]
fn load_messages_reports_missing_file() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let path = tmp.path().join("absent.txt");

    match load_messages(&path) {
        Err(RingError::Read { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("expected read error, got {other:?}"),
    }
}
