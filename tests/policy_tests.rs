#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests for the realtime crate.
//!
//! These tests verify that `Cargo.toml` and the fuzz manifest keep the lints
//! and feature layout the project relies on. If any test fails, the manifest
//! has drifted from the agreed-upon standards.
//!
//! All checks are synchronous filesystem reads; no async runtime needed.

use std::path::PathBuf;

/// Returns the project root directory (where Cargo.toml lives).
fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Reads a file relative to the project root and returns its contents.
fn read_project_file(relative_path: &str) -> String {
    let path = project_root().join(relative_path);
    std::fs::read_to_string(&path).unwrap_or_else(|e| {
        panic!(
            "Failed to read '{}': {}. This file is required by project policy.",
            path.display(),
            e
        )
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: panic_policy
// ─────────────────────────────────────────────────────────────────────────────

mod panic_policy {
    use super::*;

    const REQUIRED_DENY_LINTS: &[&str] = &[
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ];

    #[test]
    fn cargo_toml_has_all_panic_free_lints() {
        let cargo = read_project_file("Cargo.toml");

        for lint in REQUIRED_DENY_LINTS {
            let pattern = format!("{lint} = \"deny\"");
            assert!(
                cargo.contains(&pattern),
                "Cargo.toml is missing `{pattern}` in [lints.clippy]. \
                 All panic-prone lints must be set to deny level; the \
                 reconnection tasks run unattended and must never panic."
            );
        }
    }

    #[test]
    fn cargo_toml_has_lints_clippy_section() {
        let cargo = read_project_file("Cargo.toml");
        assert!(
            cargo.contains("[lints.clippy]"),
            "Cargo.toml is missing [lints.clippy] section."
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Module: feature_policy
// ─────────────────────────────────────────────────────────────────────────────

mod feature_policy {
    use super::*;

    #[test]
    fn websocket_transport_is_a_default_feature() {
        let cargo = read_project_file("Cargo.toml");
        assert!(
            cargo.contains("default = [\"transport-websocket\"]"),
            "the WebSocket transport must stay enabled by default"
        );
    }

    #[test]
    fn websocket_dependencies_are_optional() {
        let cargo = read_project_file("Cargo.toml");
        for dep in ["tokio-tungstenite", "futures-util"] {
            let line = cargo
                .lines()
                .find(|line| line.starts_with(dep))
                .unwrap_or_else(|| panic!("Cargo.toml does not declare {dep}"));
            assert!(
                line.contains("optional = true"),
                "{dep} must be optional so `default-features = false` builds stay light"
            );
        }
    }

    #[test]
    fn fuzz_crate_builds_without_default_features() {
        let fuzz = read_project_file("fuzz/Cargo.toml");
        assert!(fuzz.contains("[dependencies.bbtronic-realtime]"));
        assert!(fuzz.contains("default-features = false"));
    }

    #[test]
    fn msrv_is_declared() {
        let cargo = read_project_file("Cargo.toml");
        assert!(
            cargo.lines().any(|line| line.starts_with("rust-version")),
            "Cargo.toml must declare rust-version"
        );
    }
}
