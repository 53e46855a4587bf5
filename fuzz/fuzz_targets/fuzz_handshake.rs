#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = packwatch::tls::record::parse_handshake_messages(data);
});
