// Copyright (c) 2024-2026 The Mitto Authors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Global (system/user) config locations, searched lowest to highest
/// priority. Later files override earlier ones.
fn global_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/mitto/config.yaml"));
    paths.push(PathBuf::from("/etc/mitto/config.yml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/mitto/config.yaml"));
        paths.push(home.join(".config/mitto/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("mitto/config.yaml"));
        paths.push(cfg.join("mitto/config.yml"));
    }

    paths
}

/// Walk upward from `start` looking for a workspace-local `.mittorc`
/// (YAML despite the extension-less name, matching the dotfile convention
/// of tools like `.editorconfig`). Returns the first one found, closest
/// to `start` first.
fn find_workspace_mittorc(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(d) = dir {
        let candidate = d.join(".mittorc");
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = d.parent();
    }
    None
}

/// Load configuration by deep-merging, in order:
///
/// 1. global search paths ([`global_search_paths`])
/// 2. the workspace-local `.mittorc`, discovered by walking up from
///    `workspace_dir` (or the process cwd when `None`)
/// 3. `server_override`, a YAML layer supplied by the caller (e.g. the
///    HTTP surface's own per-request settings) — wins over everything
///
/// This is the precedence spec §4.7 and §9 describe: "merging global,
/// workspace `.mittorc`, and server-specific overrides in that precedence
/// (server overrides workspace, workspace overrides global)".
pub fn load(
    workspace_dir: Option<&Path>,
    server_override: Option<&serde_yaml::Value>,
) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in global_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading global config layer");
            merge_file(&mut merged, &path)?;
        }
    }

    let start = match workspace_dir {
        Some(p) => p.to_path_buf(),
        None => std::env::current_dir().unwrap_or_default(),
    };
    if let Some(path) = find_workspace_mittorc(&start) {
        debug!(path = %path.display(), "loading workspace .mittorc");
        merge_file(&mut merged, &path)?;
    }

    if let Some(layer) = server_override {
        debug!("applying server-specific override layer");
        merge_yaml(&mut merged, layer.clone());
    }

    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

fn merge_file(dst: &mut serde_yaml::Value, path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let layer: serde_yaml::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    merge_yaml(dst, layer);
    Ok(())
}

/// Deep-merge `src` into `dst`; `src` wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
