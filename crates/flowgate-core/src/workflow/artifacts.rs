//! File-like artifacts extracted from step output.
//!
//! An artifact is a fenced code block that names the file it belongs to,
//! either on the fence line, on the line right before the fence, or in a
//! comment on one of the first lines of the block:
//!
//! ````text
//! ```rust path=src/lib.rs          <- fence attribute
//! File: `src/lib.rs`               <- heading / label before the fence
//! // file: src/lib.rs              <- comment inside the block
//! ````
//!
//! Blocks without a file hint are plain snippets and are not artifacts.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub content: String,
}

/// Extract every fenced block that carries a file path hint.
pub fn extract_artifacts(output: &str) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    let lines: Vec<&str> = output.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i].trim_start();
        let Some(info) = line.strip_prefix("```") else {
            i += 1;
            continue;
        };

        let label_hint = i
            .checked_sub(1)
            .and_then(|prev| path_from_label(lines[prev]));
        let (language, fence_hint) = parse_fence_info(info);

        let mut body = Vec::new();
        let mut j = i + 1;
        while j < lines.len() && !lines[j].trim_start().starts_with("```") {
            body.push(lines[j]);
            j += 1;
        }
        let content = body.join("\n");

        let path = fence_hint
            .or(label_hint)
            .or_else(|| path_from_comment(&content));
        if let Some(path) = path {
            if !content.trim().is_empty() {
                artifacts.push(Artifact {
                    path,
                    language,
                    content,
                });
            }
        }

        // Skip the closing fence (or run off the end for an unclosed block).
        i = j + 1;
    }

    artifacts
}

/// Write artifacts below `root`, refusing absolute paths and `..` segments.
/// Returns the paths that were written.
pub fn write_artifacts(root: &Path, artifacts: &[Artifact]) -> std::io::Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for artifact in artifacts {
        let Some(relative) = sanitize_relative(&artifact.path) else {
            tracing::warn!(
                "[Artifacts] Skipping artifact with unsafe path '{}'",
                artifact.path
            );
            continue;
        };
        let target = root.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut body = artifact.content.clone();
        if !body.ends_with('\n') {
            body.push('\n');
        }
        std::fs::write(&target, body)?;
        written.push(target);
    }
    Ok(written)
}

fn sanitize_relative(path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

fn parse_fence_info(info: &str) -> (Option<String>, Option<String>) {
    let mut language = None;
    let mut path = None;
    for (idx, part) in info.split_whitespace().enumerate() {
        if let Some(value) = part
            .strip_prefix("path=")
            .or_else(|| part.strip_prefix("file="))
            .or_else(|| part.strip_prefix("filename="))
        {
            let value = value.trim_matches(|c| c == '"' || c == '\'');
            if looks_like_path(value) {
                path = Some(value.to_string());
            }
        } else if idx == 0 && !looks_like_path(part) {
            language = Some(part.to_string());
        } else if looks_like_path(part) {
            // ```src/main.rs or ```rust src/main.rs
            path = Some(part.to_string());
        }
    }
    (language, path)
}

fn path_from_label(line: &str) -> Option<String> {
    let trimmed = line
        .trim()
        .trim_start_matches('#')
        .trim()
        .trim_matches('*')
        .trim();
    let lower = trimmed.to_ascii_lowercase();
    let rest = ["file:", "filename:", "path:"]
        .iter()
        .find_map(|prefix| {
            lower
                .starts_with(prefix)
                .then(|| trimmed[prefix.len()..].trim())
        })
        .unwrap_or(trimmed);
    let candidate = rest
        .trim_matches(|c| c == '`' || c == '*' || c == ':' || c == '"')
        .trim();
    looks_like_path(candidate).then(|| candidate.to_string())
}

fn path_from_comment(content: &str) -> Option<String> {
    for line in content.lines().take(3) {
        let trimmed = line.trim();
        let comment = trimmed
            .strip_prefix("//")
            .or_else(|| trimmed.strip_prefix('#'))
            .or_else(|| trimmed.strip_prefix("--"))
            .or_else(|| {
                trimmed
                    .strip_prefix("<!--")
                    .map(|rest| rest.trim_end_matches("-->"))
            });
        let Some(comment) = comment else { continue };
        let comment = comment.trim();
        let candidate = ["file:", "filename:", "path:"]
            .iter()
            .find_map(|prefix| comment.strip_prefix(prefix))
            .map(str::trim)
            .or_else(|| comment.split_whitespace().next().filter(|p| p.contains('/')));
        if let Some(candidate) = candidate {
            if looks_like_path(candidate) {
                return Some(candidate.to_string());
            }
        }
    }
    None
}

fn looks_like_path(s: &str) -> bool {
    if s.is_empty() || s.len() > 200 || s.contains(char::is_whitespace) {
        return false;
    }
    if s.starts_with("http://") || s.starts_with("https://") {
        return false;
    }
    if !s.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '.' || c == '_') {
        return false;
    }
    let file_name = s.rsplit(['/', '\\']).next().unwrap_or(s);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) => {
            !ext.is_empty()
                && ext.len() <= 10
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
                && (!stem.is_empty() || file_name.starts_with('.'))
        }
        None => s.contains('/') && !s.ends_with('/'),
    }
}
