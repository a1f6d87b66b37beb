//! Filesystem-backed path resolution and containment checks.

use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::core::containment::{is_within, push_normalized};

/// Resolve `path` to an absolute form the way the kernel would once missing
/// directories are created.
///
/// Components are applied one at a time and every prefix that exists is
/// canonicalized before the next component, so `..` always steps out of the
/// real directory a symlink points at. Missing components stay lexical.
pub fn resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut resolved = PathBuf::new();
    for component in absolute.components() {
        resolved = push_normalized(resolved, [component]);
        if matches!(component, Component::Normal(_) | Component::ParentDir)
            && let Ok(canonical) = fs::canonicalize(&resolved)
        {
            resolved = canonical;
        }
    }
    resolved
}

/// True iff `candidate` resolves to `root` or a descendant of it.
pub fn is_contained(candidate: &Path, root: &Path) -> bool {
    is_within(&resolve(candidate), &resolve(root))
}

/// True iff both paths resolve to the same location.
pub fn same_file(a: &Path, b: &Path) -> bool {
    resolve(a) == resolve(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::containment::is_within_by_ancestors;

    #[test]
    fn resolves_missing_files_under_existing_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fs::canonicalize(temp.path()).expect("canonical root");
        fs::create_dir_all(root.join("strategies")).expect("mkdir");

        let resolved = resolve(&root.join("strategies/new/../fresh.py"));
        assert_eq!(resolved, root.join("strategies/fresh.py"));
        assert!(is_contained(&root.join("strategies/fresh.py"), &root.join("strategies")));
        assert!(is_contained(&root.join("strategies"), &root.join("strategies")));
    }

    #[test]
    fn dot_dot_escapes_are_not_contained() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("strategies")).expect("mkdir");
        fs::create_dir_all(root.join("engine")).expect("mkdir");

        assert!(!is_contained(
            &root.join("strategies/../engine/backtest.py"),
            &root.join("strategies")
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_followed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("strategies")).expect("mkdir");
        fs::create_dir_all(root.join("engine")).expect("mkdir");
        std::os::unix::fs::symlink(root.join("engine"), root.join("strategies/link"))
            .expect("symlink");

        assert!(!is_contained(
            &root.join("strategies/link/backtest.py"),
            &root.join("strategies")
        ));
        assert!(is_contained(
            &root.join("strategies/link/backtest.py"),
            &root.join("engine")
        ));
    }

    #[cfg(unix)]
    #[test]
    fn dot_dot_after_missing_dir_still_follows_symlinks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fs::canonicalize(temp.path()).expect("canonical root");
        fs::create_dir_all(root.join("strategies")).expect("mkdir");
        fs::create_dir_all(root.join("engine")).expect("mkdir");
        std::os::unix::fs::symlink(root.join("engine"), root.join("strategies/link"))
            .expect("symlink");

        let sneaky = root.join("strategies/link/missing/../backtest.py");
        assert_eq!(resolve(&sneaky), root.join("engine/backtest.py"));
        assert!(!is_contained(&sneaky, &root.join("strategies")));

        let via_missing = root.join("strategies/missing/../link/backtest.py");
        assert_eq!(resolve(&via_missing), root.join("engine/backtest.py"));
        assert!(!is_contained(&via_missing, &root.join("strategies")));
        assert!(same_file(&via_missing, &root.join("engine/backtest.py")));
    }

    #[cfg(unix)]
    #[test]
    fn dot_dot_out_of_a_symlinked_dir_lands_beside_its_target() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = fs::canonicalize(temp.path()).expect("canonical root");
        fs::create_dir_all(root.join("strategies")).expect("mkdir");
        fs::create_dir_all(root.join("outside/deep")).expect("mkdir");
        std::os::unix::fs::symlink(root.join("outside/deep"), root.join("strategies/link"))
            .expect("symlink");

        let resolved = resolve(&root.join("strategies/link/../escape.py"));
        assert_eq!(resolved, root.join("outside/escape.py"));
        assert!(!is_contained(
            &root.join("strategies/link/../escape.py"),
            &root.join("strategies")
        ));
    }

    #[test]
    fn ancestor_walk_agrees_with_prefix_check() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("strategies/nested")).expect("mkdir");
        let subtree = resolve(&root.join("strategies"));

        for candidate in [
            "strategies",
            "strategies/nested/x.py",
            "strategies/../engine",
            "strategies_other/x.py",
        ] {
            let resolved = resolve(&root.join(candidate));
            assert_eq!(
                is_within(&resolved, &subtree),
                is_within_by_ancestors(&resolved, &subtree),
                "{candidate}"
            );
        }
    }
}
