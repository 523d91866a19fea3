//! Fuzz target for signaling messages
//!
//! Both directions of the signaling protocol are parsed from untrusted
//! WebSocket text frames.

#![no_main]

use lanbeam_signal::{ClientMessage, ServerMessage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let _ = serde_json::from_str::<ClientMessage>(text);
    if let Ok(msg) = ServerMessage::from_json(text) {
        let _ = msg.to_json();
    }
});
