//! Build script for fwsync
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for `fwsync --version`.

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
