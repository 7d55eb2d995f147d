pub mod data;
pub mod network;
pub mod read_file;
pub mod time;

use std::path::{Component, Path, PathBuf};

/// Resolve `p` inside the working directory.
///
/// Relative paths are joined to `working_dir`; absolute paths are taken as
/// given. Returns `None` when the result, after folding `.` and `..`, lies
/// outside `working_dir`.
pub(crate) fn resolve_path(p: &str, working_dir: &Path) -> Option<PathBuf> {
    let root = normalize(working_dir);
    let path = normalize(&root.join(p));
    path.starts_with(&root).then_some(path)
}

/// Lexically fold `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Cut `text` to at most `max` bytes on a char boundary.
pub(crate) fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}
