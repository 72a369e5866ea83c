#![no_main]

use libfuzzer_sys::fuzz_target;
use logport_ingest::framing::{FrameReassembler, FramingPolicy};

fuzz_target!(|data: &[u8]| {
    // 작은 최대 크기로 잘림 경로까지 자주 타도록 한다
    let policy = FramingPolicy {
        max_frame: 512,
        addtl_delim: Some(0x00),
        ..FramingPolicy::default()
    };
    let mut reasm = FrameReassembler::new(policy);
    let mut out = Vec::new();

    // 입력을 둘로 쪼개 임의 경계의 부분 수신을 흉내낸다
    let split = data.first().copied().unwrap_or(0) as usize % (data.len() + 1);
    let (a, b) = data.split_at(split);

    // 크래시나 패닉 없이 Ok 또는 Err을 반환해야 한다
    if reasm.push(a, &mut out).is_ok() {
        let _ = reasm.push(b, &mut out);
    }
    let _ = reasm.finish_regular();

    // 완성된 프레임은 항상 최대 크기 이하
    for frame in &out {
        assert!(frame.payload.len() <= 512);
    }
});
