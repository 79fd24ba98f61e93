#![no_main]

use libfuzzer_sys::fuzz_target;
use ssh_hostca::auth_gate::{ClientTls, is_authenticated, matches_hostname};

fuzz_target!(|data: &[u8]| {
    // Treat the input as a leaf certificate and the hostname claim
    let split = data.len() / 2;
    let (der, hostname) = data.split_at(split);
    let tls = ClientTls::with_chain(vec![der.to_vec()]);
    let _ = is_authenticated(&tls);
    if let Ok(hostname) = std::str::from_utf8(hostname) {
        let _ = matches_hostname(hostname, &tls);
    }
});
