mod sign;

pub use sign::{sign_path, verify_path, SignError, SignedQuery, CLOCK_SKEW_SECS, PERMANENT};

/// Maximum accepted length of a virtual path, in bytes.
pub const MAX_PATH_LEN: usize = 2048;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("path exceeds {MAX_PATH_LEN} bytes (got {0})")]
    TooLong(usize),
    #[error("path contains an embedded NUL byte")]
    EmbeddedNul,
    #[error("path contains a parent-directory segment")]
    ParentSegment,
}

/// Canonicalize a virtual path: backslashes become forward slashes, runs of
/// slashes collapse, `.` segments are dropped, and the result is rooted.
/// Rejects `..` segments, embedded NUL, and over-long inputs.
///
/// Canonicalization is idempotent: `canonicalize(canonicalize(p)) == canonicalize(p)`.
pub fn canonicalize(path: &str) -> Result<String, Error> {
    if path.len() > MAX_PATH_LEN {
        return Err(Error::TooLong(path.len()));
    }
    if path.contains('\0') {
        return Err(Error::EmbeddedNul);
    }

    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(Error::ParentSegment),
            segment => {
                out.push('/');
                out.push_str(segment);
            }
        }
    }

    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Normalize a canonical path for use as a directory: always ends in `/`.
pub fn as_dir(canonical: &str) -> String {
    if canonical.ends_with('/') {
        canonical.to_string()
    } else {
        format!("{canonical}/")
    }
}

/// The final path segment, or the empty string for the root.
pub fn file_name(canonical: &str) -> &str {
    canonical.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// The parent directory of a canonical path, ending in `/`.
pub fn parent_dir(canonical: &str) -> String {
    let trimmed = canonical.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => format!("{}/", &trimmed[..idx]),
    }
}

/// Strip `mount_path` from a canonical virtual path, yielding the
/// mount-relative subpath without a leading slash.
///
/// Returns `None` when the path is not inside the mount, where "inside"
/// requires a segment boundary: `/mnt2` is not inside mount `/mnt`.
pub fn strip_mount_prefix<'p>(mount_path: &str, canonical: &'p str) -> Option<&'p str> {
    if mount_path == "/" {
        return Some(canonical.trim_start_matches('/'));
    }
    let rest = canonical.strip_prefix(mount_path)?;
    match rest.as_bytes().first() {
        None => Some(""),
        Some(b'/') => Some(&rest[1..]),
        Some(_) => None,
    }
}

/// True when `candidate` is a strict prefix of `mount_path` at a segment
/// boundary, i.e. `candidate` names a virtual directory above the mount.
pub fn is_strict_parent(candidate: &str, mount_path: &str) -> bool {
    if candidate == mount_path {
        return false;
    }
    if candidate == "/" {
        return mount_path.starts_with('/') && mount_path != "/";
    }
    mount_path
        .strip_prefix(candidate)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// The next path segment of `mount_path` below virtual directory `parent`.
pub fn next_segment<'m>(parent: &str, mount_path: &'m str) -> Option<&'m str> {
    if !is_strict_parent(parent, mount_path) {
        return None;
    }
    let rest = if parent == "/" {
        &mount_path[1..]
    } else {
        &mount_path[parent.len() + 1..]
    };
    rest.split('/').next().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_basic() {
        assert_eq!(canonicalize("a/b/c").unwrap(), "/a/b/c");
        assert_eq!(canonicalize("/a//b///c/").unwrap(), "/a/b/c");
        assert_eq!(canonicalize("a\\b\\c").unwrap(), "/a/b/c");
        assert_eq!(canonicalize("./a/./b").unwrap(), "/a/b");
        assert_eq!(canonicalize("").unwrap(), "/");
        assert_eq!(canonicalize("/").unwrap(), "/");
        assert_eq!(canonicalize("\\\\").unwrap(), "/");
    }

    #[test]
    fn test_canonicalize_idempotent() {
        for raw in ["a//b\\c/", "/x/y/z", "", "//", "m/.."] {
            let Ok(once) = canonicalize(raw) else {
                continue;
            };
            assert_eq!(canonicalize(&once).unwrap(), once);
            assert!(!once.contains(".."));
            assert!(!once.contains('\\'));
            assert!(!once.contains("//"));
        }
    }

    #[test]
    fn test_canonicalize_rejections() {
        assert_eq!(canonicalize("a/../b").unwrap_err(), Error::ParentSegment);
        assert_eq!(canonicalize("..").unwrap_err(), Error::ParentSegment);
        assert_eq!(canonicalize("a\\..\\b").unwrap_err(), Error::ParentSegment);
        assert_eq!(canonicalize("a\0b").unwrap_err(), Error::EmbeddedNul);

        let long = "a/".repeat(1025);
        assert_eq!(canonicalize(&long).unwrap_err(), Error::TooLong(2050));
    }

    #[test]
    fn test_canonicalize_snapshot() {
        insta::assert_snapshot!(canonicalize("a\\b//c/./d").unwrap(), @"/a/b/c/d");
        insta::assert_snapshot!(canonicalize("").unwrap(), @"/");
    }

    #[test]
    fn test_dir_and_segments() {
        assert_eq!(as_dir("/a/b"), "/a/b/");
        assert_eq!(as_dir("/a/b/"), "/a/b/");
        assert_eq!(as_dir("/"), "/");
        assert_eq!(file_name("/a/b.txt"), "b.txt");
        assert_eq!(file_name("/a/b/"), "b");
        assert_eq!(file_name("/"), "");
        assert_eq!(parent_dir("/a/b/c"), "/a/b/");
        assert_eq!(parent_dir("/a"), "/");
        assert_eq!(parent_dir("/"), "/");
    }

    #[test]
    fn test_strip_mount_prefix() {
        assert_eq!(strip_mount_prefix("/m", "/m/a/b"), Some("a/b"));
        assert_eq!(strip_mount_prefix("/m", "/m"), Some(""));
        assert_eq!(strip_mount_prefix("/m", "/mnt/a"), None);
        assert_eq!(strip_mount_prefix("/", "/a/b"), Some("a/b"));
        assert_eq!(strip_mount_prefix("/", "/"), Some(""));
    }

    #[test]
    fn test_virtual_parents() {
        assert!(is_strict_parent("/", "/m"));
        assert!(is_strict_parent("/a", "/a/b/c"));
        assert!(!is_strict_parent("/a", "/a"));
        assert!(!is_strict_parent("/a", "/ab"));
        assert_eq!(next_segment("/", "/m/sub"), Some("m"));
        assert_eq!(next_segment("/a", "/a/b/c"), Some("b"));
        assert_eq!(next_segment("/a", "/ab/c"), None);
    }
}
