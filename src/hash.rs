use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

// Directory Hasher: produces a stable content fingerprint for a working
// directory. Remote-mode callers don't come through here at all - they build
// their fingerprint directly from a commit sha and subpath (see
// `remote_fingerprint` below), since the git commit already *is* a content
// fingerprint and re-hashing the tree would be redundant work.
//
// Local mode has no commit to key off, so we fall back to hashing the
// (path, mtime) pairs of every regular file under the tree. This is
// best-effort: a file rewritten with its mtime preserved (e.g. by some
// backup/restore tools) is invisible to this hash. Documented, not
// compensated for.
pub fn remote_fingerprint(commit_sha: &str, root_subpath: &str) -> String {
    format!("{commit_sha}:{root_subpath}")
}

pub fn local_fingerprint(dir: &Path) -> anyhow::Result<String> {
    let mut entries: Vec<(String, u128)> = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("walking {dir:?}"))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry
            .metadata()
            .with_context(|| format!("stat {:?}", entry.path()))?;
        let mtime_ms = metadata
            .modified()
            .with_context(|| format!("mtime of {:?}", entry.path()))?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let abs_path = entry
            .path()
            .canonicalize()
            .unwrap_or_else(|_| entry.path().to_path_buf());
        entries.push((abs_path.to_string_lossy().into_owned(), mtime_ms));
    }
    // Deterministic ordering by absolute path, per spec.
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (path, mtime_ms) in &entries {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(mtime_ms.to_le_bytes());
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}
