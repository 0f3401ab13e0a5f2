// tests/property/consistency_test.rs

//! FlowBuffer invariants under arbitrary producer/consumer interleavings:
//! the accounting identity `free + used = size` always holds, and words come
//! out in exactly the order they went in.

use peridotdb_backup::core::buffer::FlowBuffer;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    /// Write up to this many words (clamped to max write).
    Write(usize),
    /// Drain one read window if available.
    Read,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..=128).prop_map(Op::Write),
        Just(Op::Read),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_accounting_and_fifo_order(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let mut buf = FlowBuffer::setup(1024, 16, 64, 64, 128).unwrap();
        let size = buf.usable_words();
        let mut next_value: u32 = 0;
        let mut produced: Vec<u32> = Vec::new();
        let mut consumed: Vec<u32> = Vec::new();

        for op in &ops {
            match op {
                Op::Write(n) => {
                    if let Some(window) = buf.write_window(*n) {
                        for slot in window.iter_mut() {
                            *slot = next_value;
                            next_value = next_value.wrapping_add(1);
                        }
                        buf.commit_write(*n);
                        let start = next_value.wrapping_sub(*n as u32);
                        produced.extend((0..*n as u32).map(|i| start.wrapping_add(i)));
                    }
                }
                Op::Read => {
                    let taken = match buf.read_window() {
                        Some(win) if !win.data.is_empty() => Some(win.data.to_vec()),
                        _ => None,
                    };
                    if let Some(words) = taken {
                        buf.release_read(words.len());
                        consumed.extend(words);
                    }
                }
            }
            prop_assert_eq!(buf.free_words() + buf.used_words(), size);
        }

        // Flush the tail and compare the full streams.
        buf.mark_eof();
        loop {
            let taken = match buf.read_window() {
                Some(win) if !win.data.is_empty() => win.data.to_vec(),
                _ => break,
            };
            buf.release_read(taken.len());
            consumed.extend(taken);
        }
        prop_assert_eq!(consumed, produced);
    }
}
