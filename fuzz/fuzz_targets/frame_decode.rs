//! Fuzz target for channel frame decoding
//!
//! Decoding arbitrary channel messages must return Ok or Err, never panic.

#![no_main]

use lanbeam_files::{ChannelMessage, Frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let binary = ChannelMessage::Binary(data.to_vec());
    let _ = Frame::decode(&binary);

    if let Ok(text) = std::str::from_utf8(data) {
        let control = ChannelMessage::Text(text.to_string());
        let _ = Frame::decode(&control);
    }
});
