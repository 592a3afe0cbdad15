use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_xoshiro::Xoshiro256StarStar;
use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

/// Patterns used when none are configured, or when a directory is given.
pub const DEFAULT_PATTERNS: &[&str] = &[
    "*tests.yaml",
    "*tests.yml",
    "tests/**/*tests.yaml",
    "tests/**/*tests.yml",
];

/// Directories never descended into while globbing.
const SKIPPED_DIRS: &[&str] = &["node_modules", "target"];

/// Seedable PRNG used for every shuffle in a run.
pub type ShuffleRng = Xoshiro256StarStar;

/// Errors resolving test file patterns.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("No test files found matching: {}", .0.join(", "))]
    NoTestFiles(Vec<String>),
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A reproducible RNG when `seed` is given, an entropy-seeded one otherwise.
pub fn shuffle_rng(seed: Option<u64>) -> ShuffleRng {
    match seed {
        Some(seed) => ShuffleRng::seed_from_u64(seed),
        None => ShuffleRng::from_entropy(),
    }
}

/// Resolve `patterns` against `root` to absolute, de-duplicated paths, then
/// shuffle them.
///
/// # Errors
///
/// Returns [`DiscoveryError::NoTestFiles`] if nothing matched.
pub fn discover(
    patterns: &[String],
    root: &Path,
    rng: &mut ShuffleRng,
) -> Result<Vec<PathBuf>, DiscoveryError> {
    let resolved = resolve(patterns, root)?;
    if resolved.is_empty() {
        return Err(DiscoveryError::NoTestFiles(patterns.to_vec()));
    }
    let mut files: Vec<PathBuf> = resolved.into_iter().collect();
    files.shuffle(rng);
    debug!(count = files.len(), "discovered test files");
    Ok(files)
}

/// Resolve patterns in a deterministic order.
///
/// A pattern naming an existing file selects it; one naming a directory
/// expands to [`DEFAULT_PATTERNS`] under that directory; anything else is
/// treated as a glob (`*`, `?`, `**/`).
///
/// # Errors
///
/// Returns [`DiscoveryError::Pattern`] for a glob that cannot be compiled.
pub fn resolve(patterns: &[String], root: &Path) -> Result<BTreeSet<PathBuf>, DiscoveryError> {
    let mut found = BTreeSet::new();

    for pattern in patterns {
        // Re-collecting drops `.` components so the glob text matches walked paths.
        let full: PathBuf = root.join(pattern).components().collect();
        if full.is_file() {
            found.insert(absolute(&full));
            continue;
        }
        if full.is_dir() {
            for default in DEFAULT_PATTERNS {
                glob_into(&full.join(default), &mut found, pattern)?;
            }
            continue;
        }
        glob_into(&full, &mut found, pattern)?;
    }

    Ok(found)
}

fn glob_into(
    full: &Path,
    found: &mut BTreeSet<PathBuf>,
    pattern: &str,
) -> Result<(), DiscoveryError> {
    let text = full.to_string_lossy();
    let matcher = glob_to_regex(&text).map_err(|source| DiscoveryError::Pattern {
        pattern: pattern.to_owned(),
        source,
    })?;
    let base = literal_prefix(full);
    if !base.is_dir() {
        return Ok(());
    }

    let mut walker = WalkDir::new(&base).follow_links(true);
    if !text.contains("**") {
        walker = walker.max_depth(
            full.components().count().saturating_sub(base.components().count()),
        );
    }
    let walker = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e));
    for entry in walker.flatten() {
        if entry.file_type().is_file() && matcher.is_match(&entry.path().to_string_lossy()) {
            found.insert(absolute(entry.path()));
        }
    }
    Ok(())
}

fn is_skipped_dir(entry: &walkdir::DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
}

/// The deepest directory of `pattern` that contains no glob characters.
fn literal_prefix(pattern: &Path) -> PathBuf {
    let mut base = PathBuf::new();
    for component in pattern.components() {
        if let Component::Normal(part) = component
            && part.to_string_lossy().contains(['*', '?', '['])
        {
            break;
        }
        base.push(component);
    }
    // A fully literal pattern names a file; walk its directory.
    if base == pattern {
        base.pop();
    }
    base
}

/// Translate a glob into an anchored regex over `/`-separated paths.
pub fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
        i += 1;
    }
    out.push('$');
    Regex::new(&out)
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "tests: {}\n").unwrap();
    }

    fn names(found: &BTreeSet<PathBuf>, root: &Path) -> Vec<String> {
        let root = std::fs::canonicalize(root).unwrap();
        found
            .iter()
            .map(|p| p.strip_prefix(&root).unwrap().to_string_lossy().into_owned())
            .collect()
    }

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| (*p).to_owned()).collect()
    }

    // -- glob translation --

    #[test]
    fn glob_star_stays_in_one_segment() {
        let re = glob_to_regex("/w/*tests.yaml").unwrap();
        assert!(re.is_match("/w/a.tests.yaml"));
        assert!(!re.is_match("/w/sub/a.tests.yaml"));
    }

    #[test]
    fn glob_double_star_spans_directories() {
        let re = glob_to_regex("/w/tests/**/*tests.yaml").unwrap();
        assert!(re.is_match("/w/tests/a.tests.yaml"));
        assert!(re.is_match("/w/tests/x/y/a.tests.yaml"));
        assert!(!re.is_match("/w/other/a.tests.yaml"));
    }

    #[test]
    fn glob_escapes_regex_characters() {
        let re = glob_to_regex("/w/a+b/(x).yaml").unwrap();
        assert!(re.is_match("/w/a+b/(x).yaml"));
        assert!(!re.is_match("/w/aab/x.yaml"));
    }

    #[test]
    fn literal_prefix_stops_at_first_glob() {
        assert_eq!(
            literal_prefix(Path::new("/w/tests/**/*.yaml")),
            PathBuf::from("/w/tests")
        );
        assert_eq!(literal_prefix(Path::new("/w/a.yaml")), PathBuf::from("/w"));
    }

    // -- resolution --

    #[test]
    fn default_patterns_find_root_and_nested_tests() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "root.tests.yaml");
        touch(dir.path(), "tests/unit/deep.tests.yml");
        touch(dir.path(), "tests/helper.yaml");
        touch(dir.path(), "other/ignored.tests.yaml");

        let defaults = patterns(DEFAULT_PATTERNS);
        let found = resolve(&defaults, dir.path()).unwrap();
        assert_eq!(
            names(&found, dir.path()),
            vec!["root.tests.yaml", "tests/unit/deep.tests.yml"]
        );
    }

    #[test]
    fn directory_argument_expands_defaults() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "pkg/a.tests.yaml");
        touch(dir.path(), "pkg/tests/b.tests.yaml");

        let found = resolve(&patterns(&["pkg"]), dir.path()).unwrap();
        assert_eq!(
            names(&found, dir.path()),
            vec!["pkg/a.tests.yaml", "pkg/tests/b.tests.yaml"]
        );
    }

    #[test]
    fn explicit_file_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "one.tests.yaml");

        let found = resolve(
            &patterns(&["one.tests.yaml", "*.yaml", "./one.tests.yaml"]),
            dir.path(),
        )
        .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.iter().all(|p| p.is_absolute()));
    }

    #[test]
    fn hidden_and_vendor_dirs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "tests/.cache/a.tests.yaml");
        touch(dir.path(), "tests/node_modules/b.tests.yaml");
        touch(dir.path(), "tests/c.tests.yaml");

        let found = resolve(&patterns(&["tests/**/*tests.yaml"]), dir.path()).unwrap();
        assert_eq!(names(&found, dir.path()), vec!["tests/c.tests.yaml"]);
    }

    #[test]
    fn no_matches_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = shuffle_rng(Some(1));
        let err = discover(&patterns(&["*.tests.yaml"]), dir.path(), &mut rng).unwrap_err();
        assert_eq!(err.to_string(), "No test files found matching: *.tests.yaml");
    }

    #[test]
    fn seeded_shuffle_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..8 {
            touch(dir.path(), &format!("f{i}.tests.yaml"));
        }
        let pats = patterns(&["*tests.yaml"]);
        let a = discover(&pats, dir.path(), &mut shuffle_rng(Some(7))).unwrap();
        let b = discover(&pats, dir.path(), &mut shuffle_rng(Some(7))).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }
}
