#![no_main]
use std::net::{IpAddr, Ipv4Addr};
use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use openssl::rsa::Rsa;
use tlstap::{Engine, EngineConfig, KeyFormat};

fn engine() -> &'static Engine {
    static ENGINE: OnceLock<Engine> = OnceLock::new();
    ENGINE.get_or_init(|| {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        let pem = Rsa::generate(1024).unwrap().private_key_to_pem().unwrap();
        engine
            .register_key(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 443, None, &pem, KeyFormat::Pem, None)
            .unwrap();
        engine.enable_recovery(true, Some(1 << 20));
        engine
    })
}

fuzz_target!(|data: &[u8]| {
    let _ = engine().decode_packet(data);
});
