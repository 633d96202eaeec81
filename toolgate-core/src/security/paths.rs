//! Path extraction and matching
//!
//! Paths are pulled out of call parameters by key name, then normalized
//! (forward slashes, lowercase, `.` and `..` folded lexically) so a
//! traversal like `notes/../.ssh/id_rsa` cannot slip past a prefix check.
//! A relative path keeps the leading `..` segments that climb above its
//! start; see [`escapes_root`].

use serde_json::Value;

/// Parameter keys that carry a single path
pub const PATH_KEYS: &[&str] = &[
    "path",
    "file",
    "filePath",
    "file_path",
    "filename",
    "source",
    "destination",
    "target",
    "directory",
    "dir",
    "uri",
];

/// Parameter keys that carry a list of paths
pub const PATH_LIST_KEYS: &[&str] = &["paths", "files"];

/// Fragments no server may ever touch: credential stores, private keys,
/// environment files and the host application's own database.
pub const GLOBAL_FORBIDDEN_PATHS: &[&str] = &[
    ".ssh",
    "id_rsa",
    "id_ed25519",
    ".env",
    "credentials",
    ".aws",
    ".gnupg",
    "private_key",
    ".pem",
    ".key",
    "chainlesschain.db",
    "/etc/passwd",
    "/etc/shadow",
    "keystore",
];

/// Collect every path-like string in `params`, normalized.
///
/// Looks at the top level and one level of nested objects.
pub fn extract_paths(params: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect(params, &mut out);
    if let Value::Object(map) = params {
        for nested in map.values().filter(|v| v.is_object()) {
            collect(nested, &mut out);
        }
    }
    out.sort();
    out.dedup();
    out
}

fn collect(value: &Value, out: &mut Vec<String>) {
    let Value::Object(map) = value else {
        return;
    };
    for key in PATH_KEYS {
        if let Some(s) = map.get(*key).and_then(Value::as_str) {
            out.push(normalize_path(s));
        }
    }
    for key in PATH_LIST_KEYS {
        if let Some(items) = map.get(*key).and_then(Value::as_array) {
            out.extend(items.iter().filter_map(Value::as_str).map(normalize_path));
        }
    }
}

/// Normalize a raw path for matching.
pub fn normalize_path(raw: &str) -> String {
    let lowered = raw.trim().replace('\\', "/").to_lowercase();
    let stripped = lowered.strip_prefix("file://").unwrap_or(&lowered);
    let absolute = stripped.starts_with('/');

    let mut segments: Vec<&str> = Vec::new();
    for segment in stripped.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                // `/..` is `/`
                _ if absolute => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let mut joined = segments.join("/");
    if absolute {
        joined.insert(0, '/');
    }
    if stripped.ends_with('/') && !joined.ends_with('/') && !segments.is_empty() {
        joined.push('/');
    }
    joined
}

/// Whether a normalized relative path climbs above the directory it starts in.
pub fn escapes_root(path: &str) -> bool {
    path == ".." || path.starts_with("../")
}

/// First forbidden fragment contained in `path`, if any.
///
/// Relative paths are matched as if rooted, so `etc/shadow` and
/// `../../etc/passwd` hit the `/etc/...` fragments.
pub fn forbidden_fragment<'a>(path: &str, fragments: &'a [String]) -> Option<&'a str> {
    let rooted = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    fragments
        .iter()
        .find(|fragment| rooted.contains(fragment.as_str()))
        .map(String::as_str)
}

/// Whether `prefix` covers `path`.
///
/// A prefix covers a path it starts, or one that contains it right after a
/// separator, so `notes/` covers `/data/notes/a.md`.
pub fn prefix_matches(path: &str, prefix: &str) -> bool {
    let prefix = normalize_path(prefix);
    if prefix.is_empty() {
        return false;
    }
    if path.starts_with(&prefix) {
        return true;
    }
    let relative = prefix.trim_start_matches('/');
    path.contains(&format!("/{}", relative))
}
