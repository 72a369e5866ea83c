#![no_main]

use libfuzzer_sys::fuzz_target;
use logport_ingest::PeerPattern;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // 패턴 파싱은 패닉 없이 Ok 또는 Err을 반환해야 한다
    let _ = PeerPattern::parse(text);
});
