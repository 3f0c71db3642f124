use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::Match;
use std::path::{Component, Path};
use tracing::{debug, warn};

pub const BUILTIN_IGNORE_PATTERNS: [&str; 13] = [
    ".git",
    "__pycache__",
    "*.pyc",
    ".env",
    ".venv",
    "node_modules",
    "dist",
    "build",
    ".DS_Store",
    "*.log",
    "*.tmp",
    ".idea",
    ".vscode",
];

/// Project ignore files read from the workspace root, in order.
pub const PROJECT_IGNORE_FILES: [&str; 2] = [".gitignore", ".codeverseignore"];

/// Decides which paths take part in synchronization.
///
/// Project ignore files use full gitignore semantics (anchoring,
/// directory-only rules, `!` negation) and are consulted first, so a
/// negation there can re-include something the built-in list excludes.
/// The built-in list matches the name or root-relative path of the path or
/// of any ancestor.
#[derive(Debug, Clone)]
pub struct IgnoreRuleset {
    patterns: Vec<String>,
    builtin: GlobSet,
    project: Option<Gitignore>,
}

impl IgnoreRuleset {
    pub fn builtin() -> Self {
        Self::from_patterns(BUILTIN_IGNORE_PATTERNS)
    }

    /// Built-in patterns plus the project's ignore files, if any.
    pub fn load(root: &Path) -> Self {
        let mut rules = Self::builtin();
        let mut builder = GitignoreBuilder::new(root);
        let mut found = false;
        for name in PROJECT_IGNORE_FILES {
            let path = root.join(name);
            if !path.is_file() {
                continue;
            }
            found = true;
            if let Some(err) = builder.add(&path) {
                warn!("ignore_file_partial: {}: {err}", path.display());
            }
        }
        if found {
            match builder.build() {
                Ok(gitignore) => {
                    debug!("ignore_project_rules: {}", gitignore.num_ignores());
                    rules.project = Some(gitignore);
                }
                Err(err) => warn!("ignore_file_invalid: {err}"),
            }
        }
        rules
    }

    /// Built-in style rules only: fnmatch globs over names and paths.
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut kept = Vec::new();
        let mut builder = GlobSetBuilder::new();
        for raw in patterns {
            let pattern = raw.as_ref().trim().trim_matches('/');
            if pattern.is_empty() {
                continue;
            }
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                    kept.push(pattern.to_string());
                }
                Err(err) => warn!("ignore_pattern_invalid: {pattern}: {err}"),
            }
        }
        let builtin = builder.build().unwrap_or_else(|err| {
            warn!("ignore_set_build_failed: {err}");
            GlobSet::empty()
        });
        Self {
            patterns: kept,
            builtin,
            project: None,
        }
    }

    /// The built-in style patterns in effect.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn has_project_rules(&self) -> bool {
        self.project.is_some()
    }

    pub fn is_ignored(&self, relative: &Path) -> bool {
        self.is_ignored_entry(relative, false)
    }

    /// `is_dir` matters only for directory-only project rules on the path
    /// itself; ancestors are always treated as directories.
    pub fn is_ignored_entry(&self, relative: &Path, is_dir: bool) -> bool {
        if relative.as_os_str().is_empty() {
            return false;
        }
        if let Some(project) = &self.project {
            match project.matched_path_or_any_parents(relative, is_dir) {
                Match::Ignore(_) => return true,
                Match::Whitelist(_) => return false,
                Match::None => {}
            }
        }
        self.matches_builtin(relative)
    }

    fn matches_builtin(&self, relative: &Path) -> bool {
        let mut prefix = String::new();
        for component in relative.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            let name = name.to_string_lossy();
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(&name);
            if self.builtin.is_match(name.as_ref()) || self.builtin.is_match(prefix.as_str()) {
                return true;
            }
        }
        false
    }
}

impl Default for IgnoreRuleset {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    #[test]
    fn builtin_patterns_match_names_and_extensions() {
        let rules = IgnoreRuleset::builtin();
        assert!(rules.is_ignored(Path::new("foo.pyc")));
        assert!(rules.is_ignored(Path::new("pkg/mod.pyc")));
        assert!(rules.is_ignored(Path::new(".env")));
        assert!(rules.is_ignored(Path::new("server.log")));
        assert!(!rules.is_ignored(Path::new("main.py")));
        assert!(!rules.is_ignored(Path::new("docs/build.md")));
    }

    #[test]
    fn ignored_directory_excludes_its_subtree() {
        let rules = IgnoreRuleset::builtin();
        assert!(rules.is_ignored(Path::new("node_modules")));
        assert!(rules.is_ignored(Path::new("node_modules/left-pad/index.js")));
        assert!(rules.is_ignored(Path::new("web/node_modules/react/index.js")));
        assert!(rules.is_ignored(Path::new(".git/HEAD")));
    }

    #[test]
    fn gitignore_rules_extend_builtin_list() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(".gitignore"),
            "# generated\n\n/coverage/\nsecrets.json\n*.bak\n",
        )
        .expect("write ignore file");

        let rules = IgnoreRuleset::load(dir.path());
        assert!(rules.has_project_rules());
        assert!(rules.is_ignored(Path::new("coverage/index.html")));
        assert!(rules.is_ignored(Path::new("config/secrets.json")));
        assert!(rules.is_ignored(Path::new("notes.bak")));
        assert!(rules.is_ignored(Path::new("server.log")));
        assert!(!rules.is_ignored(Path::new("src/lib.rs")));
    }

    #[test]
    fn anchored_and_directory_only_rules_keep_their_meaning() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(".gitignore"), "/coverage/\ntmp/\n").expect("write");

        let rules = IgnoreRuleset::load(dir.path());
        assert!(rules.is_ignored(Path::new("coverage/index.html")));
        assert!(!rules.is_ignored(Path::new("docs/coverage/index.html")));
        assert!(rules.is_ignored_entry(Path::new("tmp"), true));
        assert!(!rules.is_ignored_entry(Path::new("tmp"), false));
        assert!(rules.is_ignored(Path::new("web/tmp/cache.json")));
    }

    #[test]
    fn negation_re_includes_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(".gitignore"), "*.csv\n!fixtures.csv\n!keep.log\n")
            .expect("write");

        let rules = IgnoreRuleset::load(dir.path());
        assert!(rules.is_ignored(Path::new("data/big.csv")));
        assert!(!rules.is_ignored(Path::new("data/fixtures.csv")));
        assert!(!rules.is_ignored(Path::new("keep.log")));
        assert!(rules.is_ignored(Path::new("other.log")));
    }

    #[test]
    fn codeverseignore_is_read_too() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(".codeverseignore"), "drafts/\n").expect("write");

        let rules = IgnoreRuleset::load(dir.path());
        assert!(rules.is_ignored(Path::new("drafts/plan.md")));
        assert!(!rules.is_ignored(Path::new("plan.md")));
    }

    #[test]
    fn missing_ignore_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules = IgnoreRuleset::load(dir.path());
        assert!(!rules.has_project_rules());
        assert_eq!(rules.patterns().len(), BUILTIN_IGNORE_PATTERNS.len());
    }

    #[test]
    fn path_prefix_patterns_match_relative_paths() {
        let rules = IgnoreRuleset::from_patterns(["assets/generated"]);
        assert!(rules.is_ignored(&PathBuf::from("assets/generated/logo.svg")));
        assert!(!rules.is_ignored(&PathBuf::from("assets/logo.svg")));
    }
}
