#![no_main]

use libfuzzer_sys::fuzz_target;
use logport_ingest::ConfLoader;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // 어떤 디렉티브 입력에도 패닉하지 않아야 한다
    let mut loader = ConfLoader::new();
    let _ = loader.load_str(text);
});
