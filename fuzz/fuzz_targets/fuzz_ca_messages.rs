#![no_main]

use libfuzzer_sys::fuzz_target;
use ssh_hostca::certificat_authority::{CaRequest, CaResponse};

fuzz_target!(|data: &[u8]| {
    // Fuzz CaRequest deserialization from raw bytes, as the server does
    let _ = serde_json::from_slice::<CaRequest>(data);

    // Fuzz CaResponse deserialization, as the client does
    let _ = serde_json::from_slice::<CaResponse>(data);
});
