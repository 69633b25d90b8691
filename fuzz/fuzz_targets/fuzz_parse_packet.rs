#![no_main]
use libfuzzer_sys::fuzz_target;
use tlstap::protocol::{parse_frame, LinkType};

fuzz_target!(|data: &[u8]| {
    for link_type in [LinkType::Ethernet, LinkType::LinuxSll, LinkType::RawIp] {
        let _ = parse_frame(data, link_type);
    }
});
