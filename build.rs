// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=MPLANE_CAMERA_VERSION");

    // Packaged builds pin the version explicitly
    let version = std::env::var("MPLANE_CAMERA_VERSION").unwrap_or_else(|_| describe_version());

    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

/// Version from `git describe`, or the crate version with the short commit hash.
fn describe_version() -> String {
    let crate_version = std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".into());

    let described = git(&["describe", "--tags", "--always", "--match", "v*"]);
    let hash = git(&["rev-parse", "--short", "HEAD"]);

    match (described, hash) {
        // "v0.1.0" or "v0.1.0-5-gabcdef1"
        (Some(desc), _) if desc.starts_with('v') => {
            let desc = desc.trim_start_matches('v');
            let parts: Vec<&str> = desc.rsplitn(3, '-').collect();
            if parts.len() >= 3 {
                let short = parts[0].strip_prefix('g').unwrap_or(parts[0]);
                format!("{}-dirty-{}", parts[2], short)
            } else {
                desc.to_string()
            }
        }
        (_, Some(hash)) => format!("{}-{}", crate_version, hash),
        _ => crate_version,
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}
