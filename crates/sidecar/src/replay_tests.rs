// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use proptest::prelude::*;

#[test]
fn empty_snapshot() {
    let buf = ReplayBuffer::new(8);
    assert!(buf.is_empty());
    assert_eq!(buf.snapshot(), b"");
}

#[test]
fn partial_line_is_retained() {
    let mut buf = ReplayBuffer::new(8);
    buf.push(b"no newline yet");
    assert_eq!(buf.line_count(), 0);
    assert_eq!(buf.snapshot(), b"no newline yet");
}

#[test]
fn lines_accumulate_across_chunks() {
    let mut buf = ReplayBuffer::new(8);
    buf.push(b"first li");
    buf.push(b"ne\nsecond\npar");
    assert_eq!(buf.line_count(), 2);
    assert_eq!(buf.snapshot(), b"first line\nsecond\npar");
}

#[test]
fn overflow_evicts_oldest_whole_lines() {
    let mut buf = ReplayBuffer::new(2);
    buf.push(b"a\nb\nc\nd");
    // "a\n" was evicted; snapshot starts at a line boundary.
    assert_eq!(buf.line_count(), 2);
    assert_eq!(buf.snapshot(), b"b\nc\nd");
}

#[test]
fn overlong_line_is_hard_split() {
    let mut buf = ReplayBuffer::new(4);
    buf.push(&vec![b'x'; MAX_LINE_BYTES + 10]);
    // The run was split into one full synthetic line plus a 10-byte partial.
    assert_eq!(buf.line_count(), 1);
    assert_eq!(buf.snapshot().len(), MAX_LINE_BYTES + 10);
}

#[test]
fn eviction_keeps_recent_content() {
    let mut buf = ReplayBuffer::new(3);
    for i in 0..100 {
        buf.push(format!("line-{i}\n").as_bytes());
    }
    assert_eq!(buf.line_count(), 3);
    assert_eq!(buf.snapshot(), b"line-97\nline-98\nline-99\n");
}

proptest! {
    #[test]
    fn line_bound_holds(chunks in proptest::collection::vec(
        proptest::collection::vec(any::<u8>(), 0..512), 0..64)
    ) {
        let mut buf = ReplayBuffer::new(16);
        for chunk in &chunks {
            buf.push(chunk);
        }
        prop_assert!(buf.line_count() <= 16);
    }

    #[test]
    fn snapshot_is_suffix_of_input(lines in proptest::collection::vec("[a-z]{0,8}", 0..64)) {
        let mut buf = ReplayBuffer::new(8);
        let mut full = Vec::new();
        for line in &lines {
            let bytes = format!("{line}\n").into_bytes();
            full.extend_from_slice(&bytes);
            buf.push(&bytes);
        }
        let snap = buf.snapshot();
        prop_assert!(full.ends_with(&snap));
    }
}
