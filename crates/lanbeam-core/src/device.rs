//! Local device label.

/// Label for the operating system this binary runs on
pub fn device_label() -> &'static str {
    label_for_os(std::env::consts::OS)
}

/// Map a Rust target OS name to the label shown to other peers
pub fn label_for_os(os: &str) -> &'static str {
    match os {
        "windows" => "Windows",
        "macos" => "Mac",
        "android" => "Android",
        "ios" => "iOS",
        "linux" => "Linux",
        _ => "Unknown",
    }
}
