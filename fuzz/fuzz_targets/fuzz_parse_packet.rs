#![no_main]
use libfuzzer_sys::fuzz_target;
use packwatch::protocol::LinkType;

fuzz_target!(|data: &[u8]| {
    for link_type in [LinkType::Ethernet, LinkType::LinuxSll, LinkType::RawIp] {
        let _ = packwatch::protocol::parse_packet(data, link_type);
    }
});
