#![no_main]

use bbtronic_realtime::stomp::{Frame, FrameReader};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    // Whole input as one transport message.
    if let Ok(Some(frame)) = Frame::decode(s) {
        let _ = Frame::decode(&frame.encode());
    }

    // Same input fed to the streaming reader one NUL-terminated chunk at a time.
    let mut reader = FrameReader::new();
    for chunk in s.split_inclusive('\0') {
        reader.push(chunk);
        while let Ok(Some(_)) = reader.next_frame() {}
    }
});
