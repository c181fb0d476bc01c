//! Alert definition files
//!
//! A definition file maps alert keys to their settings:
//!
//! ```yaml
//! alerts:
//!   shop_order_failures:
//!     query_path: "queries/order_failures.sql"
//!     params:
//!       shop: "main"
//!     alert_if:
//!       value_gt: 10
//!     message: "too many failed orders"
//!     check_every: "*/5 * * * *"
//!     slack_channel: "#shop"
//! ```
//!
//! `query_path` is resolved relative to the definition file. The query file
//! must declare its bucket expression in one of its first three lines, e.g.
//! `--BUCKET: toStartOfFifteenMinutes(--NOW--)`.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use walkdir::WalkDir;

use super::definition::AlertDefinition;

const BUCKET_MARKER: &str = "--BUCKET:";
const BUCKET_MARKER_LINES: usize = 3;

/// Read-only view of the content tree; paths are `/`-separated and relative
/// to its root
pub trait DefinitionFs: Send + Sync {
    fn read_to_string(&self, path: &str) -> io::Result<String>;

    /// Every file below the root
    fn files(&self) -> io::Result<Vec<String>>;
}

/// Content tree on disk
#[derive(Debug, Clone)]
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl DefinitionFs for DirFs {
    fn read_to_string(&self, path: &str) -> io::Result<String> {
        let relative = Path::new(path);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is outside the content root", path),
            ));
        }
        std::fs::read_to_string(self.root.join(relative))
    }

    fn files(&self) -> io::Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let segments: Vec<_> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect();
            files.push(segments.join("/"));
        }
        files.sort();
        Ok(files)
    }
}

/// Content tree held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    files: BTreeMap<String, String>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.insert(path.into(), contents.into());
        self
    }
}

impl DefinitionFs for MemoryFs {
    fn read_to_string(&self, path: &str) -> io::Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path)))
    }

    fn files(&self) -> io::Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }
}

/// Shape of a full definition file
#[derive(Debug, Deserialize)]
struct AlertConfiguration {
    #[serde(default)]
    alerts: BTreeMap<String, AlertDefinition>,
}

/// Parse one definition file and resolve its query files.
///
/// Fails as a whole if any entry is broken.
pub fn parse_alert_configuration(
    fs: &dyn DefinitionFs,
    file_path: &str,
) -> Result<Vec<AlertDefinition>, LoadError> {
    let contents = fs.read_to_string(file_path).map_err(|source| LoadError::Read {
        path: file_path.to_string(),
        source,
    })?;
    let config: AlertConfiguration =
        serde_yaml::from_str(&contents).map_err(|e| LoadError::Parse {
            path: file_path.to_string(),
            reason: e.to_string(),
        })?;

    let mut definitions = Vec::with_capacity(config.alerts.len());
    for (key, mut definition) in config.alerts {
        definition.id.group = file_path.to_string();
        definition.id.key = key.clone();

        if definition.query_path.is_empty() {
            return Err(LoadError::MissingQueryPath { key });
        }

        let query_path = clean_path(&join_relative(file_path, &definition.query_path));
        if escapes_root(&query_path) {
            return Err(LoadError::QueryFile {
                key,
                path: query_path,
                source: io::Error::new(io::ErrorKind::InvalidInput, "path leaves the content root"),
            });
        }
        let query = fs
            .read_to_string(&query_path)
            .map_err(|source| LoadError::QueryFile {
                key: key.clone(),
                path: query_path.clone(),
                source,
            })?;
        let bucket_expression =
            extract_bucket_expression(&query).ok_or_else(|| LoadError::MissingBucket {
                key: key.clone(),
                path: query_path.clone(),
            })?;

        if let Err(e) = definition.alert_if.threshold() {
            tracing::warn!(alert_id = %definition.id, error = %e, "alert condition will evaluate to an error");
        }

        definition.query_path = query_path;
        definition.query = query;
        definition.bucket_expression = bucket_expression;
        definitions.push(definition);
    }

    Ok(definitions)
}

/// Parse every definition file matching `pattern`
pub fn discover_alert_definitions(
    fs: &dyn DefinitionFs,
    pattern: &str,
) -> Result<Vec<AlertDefinition>, LoadError> {
    let files = matching_files(fs, pattern)?;
    tracing::debug!(files = ?files, "discovered alert definition files");

    let mut definitions = Vec::new();
    for file in files {
        let parsed = parse_alert_configuration(fs, &file).map_err(|e| LoadError::Discover {
            file: file.clone(),
            source: Box::new(e),
        })?;
        definitions.extend(parsed);
    }

    Ok(definitions)
}

/// Files below the root matching a glob-like pattern; `*` and `?` stay
/// within one path segment
pub fn matching_files(fs: &dyn DefinitionFs, pattern: &str) -> Result<Vec<String>, LoadError> {
    let matcher = glob_to_regex(pattern)?;
    let mut files: Vec<String> = fs
        .files()
        .map_err(|source| LoadError::Read {
            path: ".".to_string(),
            source,
        })?
        .into_iter()
        .filter(|f| matcher.is_match(f))
        .collect();
    files.sort();
    Ok(files)
}

fn glob_to_regex(pattern: &str) -> Result<Regex, LoadError> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');

    Regex::new(&re).map_err(|e| LoadError::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Bucket expression from the `--BUCKET:` marker within the first three lines
pub fn extract_bucket_expression(query: &str) -> Option<String> {
    query
        .lines()
        .take(BUCKET_MARKER_LINES)
        .find_map(|line| {
            line.find(BUCKET_MARKER)
                .map(|idx| line[idx + BUCKET_MARKER.len()..].trim().to_string())
        })
}

/// Join onto the definition file's directory; a leading `/` stays below it
fn join_relative(file_path: &str, relative: &str) -> String {
    match file_path.rfind('/') {
        Some(idx) => format!("{}/{}", &file_path[..idx], relative),
        None => relative.to_string(),
    }
}

/// Lexically resolve `.` and `..` segments of a root-relative path.
///
/// `..` segments that climb above the root are kept in front.
fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(last) if *last != "..") {
                    segments.pop();
                } else {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        ".".to_string()
    } else {
        segments.join("/")
    }
}

fn escapes_root(path: &str) -> bool {
    path == ".." || path.starts_with("../")
}

/// Definition loading errors
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("reading file {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("parsing {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("{key} - no query path defined")]
    MissingQueryPath { key: String },

    #[error("{key} - reading file {path}: {source}")]
    QueryFile {
        key: String,
        path: String,
        source: io::Error,
    },

    #[error("{key} - extracting bucket interval from {path}: Bucket Expression --BUCKET: ... not found in first 3 lines")]
    MissingBucket { key: String, path: String },

    #[error("invalid definition pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("processing {file}: {source}")]
    Discover {
        file: String,
        #[source]
        source: Box<LoadError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::definition::AlertCondition;

    const ALERTS_YAML: &str = r##"
alerts:
  cpu_usage:
    query_path: "queries/cpu_usage.sql"
    params:
      threshold: "90"
    alert_if:
      value_gt: 90
    message: "CPU usage is above 90%"
    check_every: "*/5 * * * *"
  memory_usage:
    query_path: "../shared/memory_usage.sql"
    alert_if:
      value_lt: 20
    message: "Memory available is below 20%"
    check_every: "*/10 * * * *"
    slack_channel: "#ops"
"##;

    fn content() -> MemoryFs {
        MemoryFs::new()
            .with_file("alerts/test/alerts.yaml", ALERTS_YAML)
            .with_file(
                "alerts/test/queries/cpu_usage.sql",
                "\n--BUCKET: toStartOfFiveMinutes(--NOW--)\nSELECT avg(usage) AS value FROM metrics",
            )
            .with_file(
                "alerts/shared/memory_usage.sql",
                "--BUCKET: toStartOfFifteenMinutes(--NOW--)\nSELECT avg(free) AS value FROM metrics",
            )
    }

    #[test]
    fn test_parse_alert_configuration() {
        let definitions = parse_alert_configuration(&content(), "alerts/test/alerts.yaml").unwrap();
        assert_eq!(definitions.len(), 2);

        let cpu = definitions.iter().find(|d| d.id.key == "cpu_usage").unwrap();
        assert_eq!(cpu.id.group, "alerts/test/alerts.yaml");
        assert_eq!(cpu.query_path, "alerts/test/queries/cpu_usage.sql");
        assert!(cpu.query.contains("avg(usage) AS value"));
        assert_eq!(cpu.bucket_expression, "toStartOfFiveMinutes(--NOW--)");
        assert_eq!(cpu.params["threshold"], "90");
        assert_eq!(cpu.alert_if, AlertCondition::greater_than(90.0));
        assert_eq!(cpu.message, "CPU usage is above 90%");
        assert_eq!(cpu.check_every, "*/5 * * * *");
        assert_eq!(cpu.slack_channel, None);

        let mem = definitions.iter().find(|d| d.id.key == "memory_usage").unwrap();
        assert_eq!(mem.query_path, "alerts/shared/memory_usage.sql");
        assert_eq!(mem.alert_if, AlertCondition::less_than(20.0));
        assert!(mem.params.is_empty());
        assert_eq!(mem.slack_channel.as_deref(), Some("#ops"));
    }

    #[test]
    fn test_missing_query_path() {
        let fs = MemoryFs::new().with_file(
            "a/alerts.yaml",
            "alerts:\n  cpu_usage:\n    alert_if:\n      value_gt: 90\n    check_every: \"* * * * *\"\n",
        );

        let err = parse_alert_configuration(&fs, "a/alerts.yaml").unwrap_err();
        assert!(matches!(err, LoadError::MissingQueryPath { .. }));
        assert_eq!(err.to_string(), "cpu_usage - no query path defined");
    }

    #[test]
    fn test_missing_query_file() {
        let fs = MemoryFs::new().with_file(
            "a/alerts.yaml",
            "alerts:\n  cpu_usage:\n    query_path: nope.sql\n",
        );

        let err = parse_alert_configuration(&fs, "a/alerts.yaml").unwrap_err();
        assert!(err.to_string().starts_with("cpu_usage - reading file a/nope.sql"));
    }

    #[test]
    fn test_missing_bucket_marker() {
        let fs = MemoryFs::new()
            .with_file("a/alerts.yaml", "alerts:\n  cpu_usage:\n    query_path: q.sql\n")
            .with_file("a/q.sql", "SELECT 1 AS value");

        let err = parse_alert_configuration(&fs, "a/alerts.yaml").unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("cpu_usage - "));
        assert!(message.contains("Bucket Expression --BUCKET: ... not found"));
    }

    #[test]
    fn test_unreadable_definition_file() {
        let err = parse_alert_configuration(&MemoryFs::new(), "missing.yaml").unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
    }

    #[test]
    fn test_extract_bucket_expression() {
        assert_eq!(
            extract_bucket_expression("--BUCKET: 5m\nSELECT * FROM t").as_deref(),
            Some("5m")
        );
        assert_eq!(
            extract_bucket_expression("-- Some comment\n--BUCKET:   15m   \nSELECT 1").as_deref(),
            Some("15m")
        );
        assert_eq!(
            extract_bucket_expression("SELECT 1 --BUCKET: toStartOfHour(--NOW--)").as_deref(),
            Some("toStartOfHour(--NOW--)")
        );
        assert_eq!(extract_bucket_expression("-- Some comment\nSELECT 1"), None);
        assert_eq!(
            extract_bucket_expression("-- 1\n-- 2\n-- 3\n--BUCKET: 10m\nSELECT 1"),
            None
        );
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("a/b/../c/./d.sql"), "a/c/d.sql");
        assert_eq!(clean_path("../x.sql"), "../x.sql");
        assert_eq!(clean_path("a/../../b"), "../b");
        assert_eq!(clean_path("a//b"), "a/b");
        assert_eq!(join_relative("a/b/alerts.yaml", "q.sql"), "a/b/q.sql");
        assert_eq!(join_relative("alerts.yaml", "q.sql"), "q.sql");
        assert_eq!(clean_path(&join_relative("a/alerts.yaml", "/q.sql")), "a/q.sql");
    }

    #[test]
    fn test_leading_slash_stays_below_definition_dir() {
        let fs = MemoryFs::new()
            .with_file("a/alerts.yaml", "alerts:\n  k:\n    query_path: /q.sql\n")
            .with_file("a/q.sql", "--BUCKET: toStartOfHour(--NOW--)\nSELECT 1 AS value");

        let definitions = parse_alert_configuration(&fs, "a/alerts.yaml").unwrap();
        assert_eq!(definitions[0].query_path, "a/q.sql");
    }

    #[test]
    fn test_query_path_cannot_leave_content_root() {
        let fs = MemoryFs::new()
            .with_file("a/alerts.yaml", "alerts:\n  k:\n    query_path: ../../secret.sql\n")
            .with_file("../secret.sql", "--BUCKET: toStartOfHour(--NOW--)\nSELECT 1 AS value");

        let err = parse_alert_configuration(&fs, "a/alerts.yaml").unwrap_err();
        assert!(matches!(err, LoadError::QueryFile { ref key, .. } if key == "k"));
        assert!(err.to_string().starts_with("k - reading file ../secret.sql"));
    }

    #[test]
    fn test_dir_fs_rejects_paths_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("content");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(dir.path().join("secret.sql"), "SELECT 1").unwrap();

        let fs = DirFs::new(&root);
        let err = fs.read_to_string("../secret.sql").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(fs.read_to_string("/etc/hostname").is_err());
    }

    #[test]
    fn test_glob_stays_within_segment() {
        let fs = MemoryFs::new()
            .with_file("content/a/alerts.yaml", "")
            .with_file("content/b/alerts.yaml", "")
            .with_file("content/b/nested/alerts.yaml", "")
            .with_file("content/b/other.yaml", "");

        let files = matching_files(&fs, "content/*/alerts.yaml").unwrap();
        assert_eq!(files, vec!["content/a/alerts.yaml", "content/b/alerts.yaml"]);
    }

    #[test]
    fn test_discover_fails_as_a_whole() {
        let fs = content().with_file(
            "alerts/broken/alerts.yaml",
            "alerts:\n  bad:\n    query_path: missing.sql\n",
        );

        let err = discover_alert_definitions(&fs, "alerts/*/alerts.yaml").unwrap_err();
        assert!(err.to_string().starts_with("processing alerts/broken/alerts.yaml: bad - "));
    }

    #[test]
    fn test_dir_fs_reads_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let group = dir.path().join("shop");
        std::fs::create_dir_all(group.join("queries")).unwrap();
        std::fs::write(
            group.join("alerts.yaml"),
            "alerts:\n  orders:\n    query_path: queries/orders.sql\n    alert_if:\n      value_gt: 3\n",
        )
        .unwrap();
        std::fs::write(
            group.join("queries/orders.sql"),
            "--BUCKET: toStartOfHour(--NOW--)\nSELECT count() AS value FROM orders",
        )
        .unwrap();

        let fs = DirFs::new(dir.path());
        let definitions = discover_alert_definitions(&fs, "*/alerts.yaml").unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].id.to_string(), "shop/alerts.yaml#orders");
        assert_eq!(definitions[0].query_path, "shop/queries/orders.sql");
        assert_eq!(definitions[0].bucket_expression, "toStartOfHour(--NOW--)");
    }
}
