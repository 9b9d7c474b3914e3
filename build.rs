//! Embeds the commit hash, build time, target and profile for `shoal-worker version`

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");

    let git_hash = Command::new("git")
        .args(["rev-parse", "--short=8", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let env_or_unknown = |name: &str| env::var(name).unwrap_or_else(|_| "unknown".to_string());

    println!("cargo:rustc-env=SHOAL_GIT_HASH={}", git_hash);
    println!(
        "cargo:rustc-env=SHOAL_BUILD_TIMESTAMP={}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("cargo:rustc-env=SHOAL_TARGET={}", env_or_unknown("TARGET"));
    println!("cargo:rustc-env=SHOAL_PROFILE={}", env_or_unknown("PROFILE"));
}
