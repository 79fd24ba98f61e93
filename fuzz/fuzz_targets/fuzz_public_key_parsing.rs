#![no_main]

use libfuzzer_sys::fuzz_target;
use ssh_hostca::certificat_authority::enrollment::parse_authorized_key;

fuzz_target!(|data: &[u8]| {
    // The enrollment body is arbitrary client input
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = parse_authorized_key(s);
    }
});
