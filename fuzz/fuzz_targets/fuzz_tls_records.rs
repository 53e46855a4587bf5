#![no_main]
use libfuzzer_sys::fuzz_target;
use packwatch::tls::record::RecordStream;

fuzz_target!(|data: &[u8]| {
    // Feed in two halves to exercise buffering across calls.
    let (head, tail) = data.split_at(data.len() / 2);
    let mut stream = RecordStream::new();
    if stream.feed(head).is_ok() {
        let _ = stream.feed(tail);
    }
});
