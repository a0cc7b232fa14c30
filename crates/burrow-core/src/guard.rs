//! Safe-prefix containment for destructive filesystem operations.
//!
//! Every recursive remove, chown or chmod consults a [`SafePrefixSet`]
//! before touching the filesystem. The set holds plain path strings; a path
//! is contained when its resolved form starts with one of them. Several
//! variants of each prefix are stored (raw, real, trailing-separator) so the
//! check stays a string comparison.

use std::cell::RefCell;
use std::path::{Component, Path, PathBuf};

/// Resolved paths that are never considered contained, whatever is registered.
pub const SENTINEL_PATHS: [&str; 3] = ["/", "", "."];

/// Returns `true` if `path` is one of the [`SENTINEL_PATHS`].
#[must_use]
pub fn is_sentinel(path: &str) -> bool {
    SENTINEL_PATHS.contains(&path)
}

/// Append-only set of trusted path prefixes for one orchestration.
#[derive(Debug, Default)]
pub struct SafePrefixSet {
    prefixes: RefCell<Vec<String>>,
}

impl SafePrefixSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set with each of `prefixes` registered.
    #[must_use]
    pub fn with_prefixes<I, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let set = Self::new();
        for prefix in prefixes {
            set.register(prefix.as_ref());
        }
        set
    }

    /// Registers `prefix` as a trust root.
    ///
    /// Directories contribute their raw and real forms with a trailing
    /// separator. Anything else contributes its raw and real forms plus the
    /// separator forms of its parent directory.
    pub fn register(&self, prefix: &Path) {
        if is_sentinel(&path_string(prefix)) {
            tracing::warn!(prefix = %prefix.display(), "refusing to register sentinel prefix");
            return;
        }
        let raw = absolute(prefix);
        let real = real_path(prefix);
        if real.is_dir() {
            self.push(dir_form(&raw));
            self.push(dir_form(&real));
        } else {
            self.push(path_string(&raw));
            self.push(path_string(&real));
            if let Some(parent) = raw.parent() {
                self.push(dir_form(parent));
                self.push(dir_form(&real_path(parent)));
            }
        }
        tracing::debug!(prefix = %raw.display(), "registered safe prefix");
    }

    /// Returns `true` if `path` lies under a registered prefix.
    ///
    /// The real path of `path` and the real path of its parent are both
    /// tried; a path that resolves to a sentinel is never safe.
    #[must_use]
    pub fn is_safe(&self, path: &Path) -> bool {
        let joined = joined_absolute(path);
        let real = real_path(&joined);
        let real_str = path_string(&real);
        if is_sentinel(&real_str) {
            return false;
        }
        let mut candidates = vec![if real.is_dir() { dir_form(&real) } else { real_str }];
        if let (Some(Component::Normal(_)), Some(parent)) =
            (joined.components().next_back(), joined.parent())
        {
            candidates.push(dir_form(&real_path(parent)));
        }
        let prefixes = self.prefixes.borrow();
        candidates
            .iter()
            .filter(|c| !is_sentinel(c))
            .any(|c| prefixes.iter().any(|p| c.starts_with(p.as_str())))
    }

    /// Returns a snapshot of the registered forms, in registration order.
    #[must_use]
    pub fn prefixes(&self) -> Vec<String> {
        self.prefixes.borrow().clone()
    }

    fn push(&self, form: String) {
        if is_sentinel(&form) {
            return;
        }
        let mut prefixes = self.prefixes.borrow_mut();
        if !prefixes.contains(&form) {
            prefixes.push(form);
        }
    }
}

/// Makes `path` absolute against the working directory and normalizes it
/// lexically (`.` dropped, `..` pops), without touching symlinks.
#[must_use]
pub fn absolute(path: &Path) -> PathBuf {
    normalize(&joined_absolute(path))
}

fn joined_absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    }
}

/// Lexically normalizes an absolute path.
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                let _ = out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Resolves symlinks in `path` as far as it exists.
///
/// The longest existing leading part is canonicalized (so `..` after a
/// symlink is resolved the way the kernel would) and the remaining
/// components are appended lexically, so missing paths still resolve.
#[must_use]
pub fn real_path(path: &Path) -> PathBuf {
    let joined = joined_absolute(path);
    let components: Vec<Component<'_>> = joined.components().collect();
    for split in (1..=components.len()).rev() {
        let head: PathBuf = components[..split].iter().collect();
        if let Ok(mut resolved) = head.canonicalize() {
            for component in &components[split..] {
                resolved.push(component);
            }
            return normalize(&resolved);
        }
    }
    normalize(&joined)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn dir_form(path: &Path) -> String {
    let mut s = path_string(path);
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}
