#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Trigram extraction must be total over arbitrary bytes
    let _ = nixnav_daemon::utils::extract_trigrams(data);
});
