#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use vgo_engines::export::{manifest_entry, manifest_hash};
use vgo_kernel_contracts::export::ExportManifest;
use vgo_kernel_contracts::Validate;

/// File name the manifest is stored under inside an export directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Checks an export directory against its `manifest.json`: every listed file
/// must be present with the recorded size and SHA-256, and the manifest hash
/// must recompute. Returns one line per problem; empty means intact.
pub fn verify_export_dir(dir: &Path) -> Result<Vec<String>, String> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = fs::read(&manifest_path)
        .map_err(|e| format!("failed to read {}: {e}", manifest_path.display()))?;
    let manifest: ExportManifest =
        serde_json::from_slice(&raw).map_err(|e| format!("manifest is not valid json: {e}"))?;
    manifest
        .validate()
        .map_err(|e| format!("manifest rejected: {e}"))?;

    let mut problems = Vec::new();
    let recomputed = manifest_hash(
        &manifest.window_id,
        &manifest.seal_hash,
        &manifest.acceptance_id,
        &manifest.files,
    );
    if recomputed != manifest.manifest_hash {
        problems.push(format!(
            "manifest_hash recorded {} recomputed {recomputed}",
            manifest.manifest_hash
        ));
    }

    for listed in &manifest.files {
        let path = dir.join(&listed.name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => {
                problems.push(format!("{}: missing", listed.name));
                continue;
            }
        };
        let actual = manifest_entry(&listed.name, &bytes);
        if actual.bytes != listed.bytes {
            problems.push(format!(
                "{}: size recorded {} actual {}",
                listed.name, listed.bytes, actual.bytes
            ));
        }
        if actual.sha256 != listed.sha256 {
            problems.push(format!(
                "{}: sha256 recorded {} actual {}",
                listed.name, listed.sha256, actual.sha256
            ));
        }
    }

    let listed = manifest
        .files
        .iter()
        .map(|f| f.name.as_str())
        .collect::<BTreeSet<_>>();
    let entries = fs::read_dir(dir).map_err(|e| format!("failed to list {}: {e}", dir.display()))?;
    let mut unlisted = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != MANIFEST_FILE && !listed.contains(name.as_str()) {
            unlisted.push(name);
        }
    }
    unlisted.sort();
    problems.extend(unlisted.into_iter().map(|name| format!("{name}: not in manifest")));
    Ok(problems)
}

/// `OK` when the directory verifies; otherwise the problems, one per line.
pub fn execute_verify_manifest(dir: Option<&str>) -> Result<String, String> {
    let dir = dir.ok_or_else(|| "usage: vgo verify-manifest <dir>".to_string())?;
    let problems = verify_export_dir(Path::new(dir))?;
    if problems.is_empty() {
        Ok("OK".to_string())
    } else {
        Err(problems.join("\n"))
    }
}
