//! Fuzz target for the mapping file parser.
//!
//! Arbitrary bytes must either parse or yield a `ParseError`; whatever
//! parses must survive a format/parse cycle unchanged.
//!
//! Run with:
//! cargo +nightly fuzz run parse_mapping -- -max_total_time=600

#![no_main]

use ferry_core::mapping::format::{format_table, parse_table};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(table) = parse_table(text) {
        let rewritten = format_table(&table);
        let reparsed = parse_table(&rewritten).expect("formatted table parses");
        assert_eq!(table, reparsed);
    }
});
