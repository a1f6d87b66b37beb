//! Pure path-containment comparisons.
//!
//! Both functions expect already-resolved absolute paths; resolution against
//! the filesystem lives in `io::paths`.

use std::path::{Component, Path, PathBuf};

/// True iff `candidate` equals `root` or lies beneath it (component-wise).
pub fn is_within(candidate: &Path, root: &Path) -> bool {
    candidate.starts_with(root)
}

/// Ancestor-walk variant of [`is_within`] with identical semantics.
pub fn is_within_by_ancestors(candidate: &Path, root: &Path) -> bool {
    candidate.ancestors().any(|ancestor| ancestor == root)
}

/// Append `components` to `base`, folding `.` and `..` lexically.
pub fn push_normalized<'a, I>(base: PathBuf, components: I) -> PathBuf
where
    I: IntoIterator<Item = Component<'a>>,
{
    let mut out = base;
    for component in components {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
        }
    }
    out
}
