#![no_main]

use bbtronic_realtime::TopicMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(msg) = TopicMessage::parse(s) {
            let _ = msg.to_json();
        }
    }

    let _ = serde_json::from_slice::<TopicMessage>(data);
});
