#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // The query parser must not panic on arbitrary strings
    let _ = nixnav_daemon::query::parse_query(data, |_| None);
});
