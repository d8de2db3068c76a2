use crate::cleanup::CleanupRegistry;
use crate::error::{Result, UpgradeError};
use crate::io;
use crate::paths::SystemPaths;
use crate::release::{SOURCE_RELEASE, TARGET_RELEASE};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Source file model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// Classic `deb uri suite components` lines (`*.list`).
    OneLine,
    /// deb822 stanzas (`*.sources`).
    Deb822,
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub format: SourceFormat,
    pub content: String,
}

/// Collect the root source list and every file under the parts directory.
/// Backup artifacts from earlier runs are not source files.
pub fn scan(paths: &SystemPaths) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    let root_list = paths.sources_list();
    if root_list.is_file() {
        files.push(load(&root_list, SourceFormat::OneLine)?);
    }
    let parts = paths.sources_parts();
    if parts.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&parts)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();
        for path in entries {
            if io::is_backup_artifact(&path) {
                continue;
            }
            let format = match path.extension().and_then(|e| e.to_str()) {
                Some("list") => SourceFormat::OneLine,
                Some("sources") => SourceFormat::Deb822,
                _ => continue,
            };
            files.push(load(&path, format)?);
        }
    }
    Ok(files)
}

fn load(path: &Path, format: SourceFormat) -> Result<SourceFile> {
    Ok(SourceFile {
        path: path.to_path_buf(),
        format,
        content: std::fs::read_to_string(path)?,
    })
}

fn release_pattern(release: &str) -> Regex {
    Regex::new(&format!(r"\b{}\b", regex::escape(release))).expect("valid release regex")
}

/// Whether the text names `release` as a whole word.
pub fn mentions(content: &str, release: &str) -> bool {
    release_pattern(release).is_match(content)
}

/// Rewrite every whole-word occurrence of `from` to `to`. Suite variants like
/// `bookworm-security` are covered because the word boundary sits before the
/// hyphen.
pub fn rewrite_release(content: &str, from: &str, to: &str) -> String {
    release_pattern(from).replace_all(content, to).into_owned()
}

// ---------------------------------------------------------------------------
// Distribution-origin classification
// ---------------------------------------------------------------------------

const DISTRO_DOMAIN: &str = "debian.org";
const DISTRO_KEYRING_PREFIX: &str = "debian-archive";
const STANDARD_COMPONENTS: &[&str] = &["main", "contrib", "non-free", "non-free-firmware"];

#[derive(Debug)]
struct SourceEntry {
    uris: Vec<String>,
    suites: Vec<String>,
    components: Vec<String>,
    signed_by: Option<String>,
    raw: String,
}

impl SourceEntry {
    fn names_release(&self, release: &str) -> bool {
        mentions(&self.raw, release)
    }

    /// A source belongs to the distribution when its origin URL matches the
    /// vendor mirror domain, it uses the mirror indirection scheme, it is
    /// signed by the vendor archive keyring, or it pairs the release name
    /// with the standard component set (a plain mirror).
    fn is_distro_operated(&self, release: &str) -> bool {
        if self.uris.iter().any(|u| uri_is_distro(u)) {
            return true;
        }
        if let Some(signed_by) = &self.signed_by {
            if signed_by.contains(DISTRO_KEYRING_PREFIX) {
                return true;
            }
        }
        let suite_matches = self
            .suites
            .iter()
            .any(|s| s == release || s.starts_with(&format!("{release}-")));
        suite_matches
            && !self.components.is_empty()
            && self
                .components
                .iter()
                .all(|c| STANDARD_COMPONENTS.contains(&c.as_str()))
    }
}

fn uri_is_distro(uri: &str) -> bool {
    if uri.starts_with("mirror+file:") || uri.starts_with("mirror:") {
        return true;
    }
    let Some(host) = uri
        .split_once("://")
        .map(|(_, rest)| rest.split(['/', ':']).next().unwrap_or(""))
    else {
        return false;
    };
    host == DISTRO_DOMAIN || host.ends_with(&format!(".{DISTRO_DOMAIN}"))
}

fn parse_one_line(line: &str) -> Option<SourceEntry> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let mut tokens = trimmed.split_whitespace().peekable();
    let kind = tokens.next()?;
    if kind != "deb" && kind != "deb-src" {
        return None;
    }

    let mut signed_by = None;
    if tokens.peek().map(|t| t.starts_with('[')).unwrap_or(false) {
        // Bracketed option block, possibly spanning several tokens.
        let mut opts = String::new();
        for token in tokens.by_ref() {
            opts.push_str(token.trim_matches(['[', ']']));
            opts.push(' ');
            if token.ends_with(']') {
                break;
            }
        }
        for opt in opts.split_whitespace() {
            if let Some(value) = opt.strip_prefix("signed-by=") {
                signed_by = Some(value.to_string());
            }
        }
    }

    let uri = tokens.next()?.to_string();
    let suite = tokens.next()?.to_string();
    let components: Vec<String> = tokens.map(String::from).collect();
    Some(SourceEntry {
        uris: vec![uri],
        suites: vec![suite],
        components,
        signed_by,
        raw: trimmed.to_string(),
    })
}

fn parse_deb822(content: &str) -> Vec<SourceEntry> {
    let mut entries = Vec::new();
    for stanza in content.split("\n\n") {
        let mut uris = Vec::new();
        let mut suites = Vec::new();
        let mut components = Vec::new();
        let mut signed_by = None;
        for line in stanza.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "uris" => uris.extend(value.split_whitespace().map(String::from)),
                "suites" => suites.extend(value.split_whitespace().map(String::from)),
                "components" => components.extend(value.split_whitespace().map(String::from)),
                "signed-by" => signed_by = Some(value.to_string()),
                _ => {}
            }
        }
        if !uris.is_empty() {
            entries.push(SourceEntry {
                uris,
                suites,
                components,
                signed_by,
                raw: stanza.to_string(),
            });
        }
    }
    entries
}

fn entries(file: &SourceFile) -> Vec<SourceEntry> {
    match file.format {
        SourceFormat::OneLine => file.content.lines().filter_map(parse_one_line).collect(),
        SourceFormat::Deb822 => parse_deb822(&file.content),
    }
}

/// File-level origin decision: every entry that names the source release must
/// be distribution-operated. A file mixing vendor and third-party entries is
/// left alone rather than partially rewritten.
pub fn is_distro_operated(file: &SourceFile) -> bool {
    let entries = entries(file);
    let naming: Vec<&SourceEntry> = entries
        .iter()
        .filter(|e| e.names_release(SOURCE_RELEASE))
        .collect();
    !naming.is_empty()
        && naming
            .iter()
            .all(|e| e.is_distro_operated(SOURCE_RELEASE))
}

// ---------------------------------------------------------------------------
// Switch engine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SwitchOutcome {
    pub rewritten: Vec<PathBuf>,
    pub third_party: Vec<PathBuf>,
    /// True when nothing referenced the source release but the target release
    /// is already present: a prior interrupted run finished the rewriting.
    pub already_switched: bool,
}

/// Remove `.bak.*` artifacts left next to source files by a prior interrupted
/// run of this phase. Backups taken by the current run are registered with
/// the cleanup registry instead and are not touched here.
pub fn clear_stale_backups(paths: &SystemPaths) -> Result<usize> {
    let mut removed = 0;
    let mut dirs = vec![paths.sources_parts()];
    if let Some(parent) = paths.sources_list().parent() {
        dirs.push(parent.to_path_buf());
    }
    for dir in dirs {
        if !dir.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() && io::is_backup_artifact(&path) {
                debug!(path = %path.display(), "removing stale backup from earlier run");
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Rewrite every distribution-operated source file naming the source release
/// to the target release, taking a registered backup of each first.
/// Third-party files are reported and never modified.
pub fn switch_all(
    paths: &SystemPaths,
    dry_run: bool,
    registry: &mut CleanupRegistry,
) -> Result<SwitchOutcome> {
    if !dry_run {
        clear_stale_backups(paths)?;
    }

    let files = scan(paths)?;
    let mut outcome = SwitchOutcome::default();
    let mut names_target = false;

    for file in &files {
        if !mentions(&file.content, SOURCE_RELEASE) {
            if mentions(&file.content, TARGET_RELEASE) && is_distro_operated_target(file) {
                names_target = true;
            }
            continue;
        }
        if !is_distro_operated(file) {
            warn!(
                path = %file.path.display(),
                "third-party source references {SOURCE_RELEASE}; leaving untouched"
            );
            outcome.third_party.push(file.path.clone());
            continue;
        }

        let rewritten = rewrite_release(&file.content, SOURCE_RELEASE, TARGET_RELEASE);
        if dry_run {
            info!(
                path = %file.path.display(),
                "dry-run: would rewrite {SOURCE_RELEASE} -> {TARGET_RELEASE}"
            );
            outcome.rewritten.push(file.path.clone());
            continue;
        }

        let backup = io::backup_path(&file.path);
        std::fs::copy(&file.path, &backup)?;
        registry.track_modified(&file.path, &backup);

        let mode = std::fs::metadata(&file.path)?.permissions();
        io::atomic_write(&file.path, rewritten.as_bytes())?;
        std::fs::set_permissions(&file.path, mode)?;

        info!(
            path = %file.path.display(),
            "rewrote {SOURCE_RELEASE} -> {TARGET_RELEASE}"
        );
        outcome.rewritten.push(file.path.clone());
    }

    if outcome.rewritten.is_empty() {
        if names_target {
            info!("source lists already reference {TARGET_RELEASE}; nothing to rewrite");
            outcome.already_switched = true;
            return Ok(outcome);
        }
        return Err(UpgradeError::NoSourcesRewritten);
    }
    Ok(outcome)
}

/// Same file-level decision, but for entries naming the target release. Used
/// to recognize a re-run after the rewrite already happened.
fn is_distro_operated_target(file: &SourceFile) -> bool {
    let entries = entries(file);
    let naming: Vec<&SourceEntry> = entries
        .iter()
        .filter(|e| e.names_release(TARGET_RELEASE))
        .collect();
    !naming.is_empty()
        && naming
            .iter()
            .all(|e| e.is_distro_operated(TARGET_RELEASE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::ChildTracker;
    use tempfile::TempDir;

    const MAIN_LIST: &str = "\
deb http://deb.debian.org/debian bookworm main contrib non-free-firmware
deb http://deb.debian.org/debian bookworm-updates main
deb http://security.debian.org/debian-security bookworm-security main
";

    const DOCKER_LIST: &str =
        "deb [arch=amd64 signed-by=/etc/apt/keyrings/docker.gpg] https://download.docker.com/linux/debian bookworm stable\n";

    const DEB822_MAIN: &str = "\
Types: deb
URIs: http://deb.debian.org/debian
Suites: bookworm bookworm-updates
Components: main contrib
Signed-By: /usr/share/keyrings/debian-archive-keyring.gpg
";

    fn tree(files: &[(&str, &str)]) -> (TempDir, SystemPaths) {
        let dir = TempDir::new().unwrap();
        let paths = SystemPaths::new(dir.path());
        std::fs::create_dir_all(paths.sources_parts()).unwrap();
        for (name, content) in files {
            let path = if *name == "sources.list" {
                paths.sources_list()
            } else {
                paths.sources_parts().join(name)
            };
            std::fs::write(path, content).unwrap();
        }
        (dir, paths)
    }

    fn registry() -> CleanupRegistry {
        CleanupRegistry::new(ChildTracker::new())
    }

    #[test]
    fn vendor_mirror_is_distro_operated() {
        let file = SourceFile {
            path: PathBuf::from("sources.list"),
            format: SourceFormat::OneLine,
            content: MAIN_LIST.to_string(),
        };
        assert!(is_distro_operated(&file));
    }

    #[test]
    fn third_party_repo_is_not_distro_operated() {
        let file = SourceFile {
            path: PathBuf::from("docker.list"),
            format: SourceFormat::OneLine,
            content: DOCKER_LIST.to_string(),
        };
        // Suite is "bookworm" but the component set is not the standard one
        // and the host is not a vendor mirror.
        assert!(!is_distro_operated(&file));
    }

    #[test]
    fn mixed_file_is_treated_as_third_party() {
        let file = SourceFile {
            path: PathBuf::from("mixed.list"),
            format: SourceFormat::OneLine,
            content: format!("{MAIN_LIST}{DOCKER_LIST}"),
        };
        assert!(!is_distro_operated(&file));
    }

    #[test]
    fn mirror_indirection_and_keyring_count_as_distro() {
        let indirect = SourceFile {
            path: PathBuf::from("mirror.list"),
            format: SourceFormat::OneLine,
            content: "deb mirror+file:/etc/apt/mirrors.txt bookworm main\n".to_string(),
        };
        assert!(is_distro_operated(&indirect));

        let keyed = SourceFile {
            path: PathBuf::from("keyed.list"),
            format: SourceFormat::OneLine,
            content: "deb [signed-by=/usr/share/keyrings/debian-archive-keyring.gpg] \
                      https://mirror.example.net/debian bookworm weird-component\n"
                .to_string(),
        };
        assert!(is_distro_operated(&keyed));
    }

    #[test]
    fn local_mirror_with_standard_components_counts_as_distro() {
        let file = SourceFile {
            path: PathBuf::from("local.list"),
            format: SourceFormat::OneLine,
            content: "deb http://mirror.internal/debian bookworm main contrib\n".to_string(),
        };
        assert!(is_distro_operated(&file));
    }

    #[test]
    fn deb822_vendor_stanza_is_distro_operated() {
        let file = SourceFile {
            path: PathBuf::from("debian.sources"),
            format: SourceFormat::Deb822,
            content: DEB822_MAIN.to_string(),
        };
        assert!(is_distro_operated(&file));
    }

    #[test]
    fn rewrite_covers_suite_variants() {
        let out = rewrite_release(MAIN_LIST, "bookworm", "trixie");
        assert!(out.contains("debian trixie main"));
        assert!(out.contains("trixie-updates"));
        assert!(out.contains("trixie-security"));
        assert!(!mentions(&out, "bookworm"));
    }

    #[test]
    fn rewrite_does_not_touch_partial_words() {
        let out = rewrite_release("# bookworms are not a release\n", "bookworm", "trixie");
        assert!(out.contains("bookworms"));
    }

    #[test]
    fn scan_skips_backup_artifacts_and_unknown_extensions() {
        let (_dir, paths) = tree(&[
            ("sources.list", MAIN_LIST),
            ("docker.list", DOCKER_LIST),
            ("debian.sources", DEB822_MAIN),
            ("sources.list.bak.a1b2c3", MAIN_LIST),
            ("notes.txt", "not a source file"),
        ]);
        let files = scan(&paths).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["sources.list", "debian.sources", "docker.list"]);
    }

    #[test]
    fn switch_rewrites_vendor_and_reports_third_party() {
        let (_dir, paths) = tree(&[("sources.list", MAIN_LIST), ("docker.list", DOCKER_LIST)]);
        let mut reg = registry();

        let outcome = switch_all(&paths, false, &mut reg).unwrap();
        assert_eq!(outcome.rewritten, vec![paths.sources_list()]);
        assert_eq!(
            outcome.third_party,
            vec![paths.sources_parts().join("docker.list")]
        );

        let rewritten = std::fs::read_to_string(paths.sources_list()).unwrap();
        assert!(mentions(&rewritten, "trixie"));
        assert!(!mentions(&rewritten, "bookworm"));

        // Third-party file untouched.
        let docker = std::fs::read_to_string(paths.sources_parts().join("docker.list")).unwrap();
        assert_eq!(docker, DOCKER_LIST);

        // A backup sibling exists for the rewritten file.
        let backups: Vec<_> = std::fs::read_dir(paths.sources_list().parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| io::is_backup_artifact(&e.path()))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            std::fs::read_to_string(backups[0].path()).unwrap(),
            MAIN_LIST
        );
    }

    #[test]
    fn switch_clears_stale_backups_first() {
        let (_dir, paths) = tree(&[
            ("sources.list", MAIN_LIST),
            ("sources.list.bak.stale0", "old backup"),
        ]);
        let stale = paths
            .sources_list()
            .parent()
            .unwrap()
            .join("sources.list.bak.stale0");
        assert!(stale.exists());

        let mut reg = registry();
        switch_all(&paths, false, &mut reg).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn switch_fails_when_nothing_references_the_release() {
        let (_dir, paths) = tree(&[("docker.list", DOCKER_LIST)]);
        let mut reg = registry();
        let err = switch_all(&paths, false, &mut reg).unwrap_err();
        assert!(matches!(err, UpgradeError::NoSourcesRewritten));
    }

    #[test]
    fn switch_recognizes_an_already_switched_tree() {
        let already = rewrite_release(MAIN_LIST, "bookworm", "trixie");
        let (_dir, paths) = tree(&[("sources.list", &already)]);
        let mut reg = registry();

        let outcome = switch_all(&paths, false, &mut reg).unwrap();
        assert!(outcome.already_switched);
        assert!(outcome.rewritten.is_empty());
    }

    #[test]
    fn dry_run_switch_writes_nothing() {
        let (_dir, paths) = tree(&[("sources.list", MAIN_LIST)]);
        let mut reg = registry();

        let outcome = switch_all(&paths, true, &mut reg).unwrap();
        assert_eq!(outcome.rewritten.len(), 1);

        let content = std::fs::read_to_string(paths.sources_list()).unwrap();
        assert_eq!(content, MAIN_LIST);
        let siblings: Vec<_> = std::fs::read_dir(paths.sources_list().parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| io::is_backup_artifact(&e.path()))
            .collect();
        assert!(siblings.is_empty());
    }
}
