//! Artifact writer - canonical JSON, content hashes, atomic writes.
//!
//! Every artifact is written twice from one in-memory structure: a canonical
//! JSON form (keys sorted at every level, arrays untouched) and a Markdown
//! rendering. Files land through a temp file in the target directory that is
//! flushed and renamed into place, so readers never see a partial file.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Timestamp recorded in every JSON time field, and in Markdown under
/// deterministic mode.
pub const DETERMINISTIC_TIMESTAMP: &str = "1970-01-01T00:00:00Z";

/// Version stamped into every artifact.
pub const KERNEL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const INDEX_FILE: &str = "ARTIFACT_INDEX.json";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("artifact {0} did not serialize to a JSON object")]
    NotAnObject(&'static str),
}

impl ArtifactError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampMode {
    #[default]
    Deterministic,
    Wallclock,
}

impl TimestampMode {
    /// Value for a Markdown time field written now.
    pub fn stamp(self) -> String {
        match self {
            Self::Deterministic => DETERMINISTIC_TIMESTAMP.to_string(),
            Self::Wallclock => Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

impl FromStr for TimestampMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deterministic" => Ok(Self::Deterministic),
            "wallclock" => Ok(Self::Wallclock),
            other => Err(format!("invalid timestamp mode '{other}'")),
        }
    }
}

impl fmt::Display for TimestampMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deterministic => "deterministic",
            Self::Wallclock => "wallclock",
        })
    }
}

/// Metadata stamped onto an artifact at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMeta {
    pub kernel_version: String,
    pub generated_at: String,
}

/// A kernel result that can be written as a JSON + Markdown pair.
pub trait Artifact: Serialize {
    /// File stem, e.g. `ROUTE_PLAN`
    const NAME: &'static str;

    /// Human-readable rendering of the same structure.
    fn render_markdown(&self, meta: &ArtifactMeta) -> String;
}

/// Re-key every object in sorted order. Arrays keep their order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        _ => value.clone(),
    }
}

/// Canonical bytes: sorted keys, two-space indent, trailing newline.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    format!("{:#}\n", canonicalize(value)).into_bytes()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> Result<String, ArtifactError> {
    let bytes = fs::read(path).map_err(|e| ArtifactError::io(path, e))?;
    Ok(sha256_hex(&bytes))
}

/// Write `bytes` to `path` via a flushed temp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| ArtifactError::io(&dir, e))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let tmp_path = dir.join(format!(".{file_name}.tmp"));

    let mut file = fs::File::create(&tmp_path).map_err(|e| ArtifactError::io(&tmp_path, e))?;
    file.write_all(bytes)
        .map_err(|e| ArtifactError::io(&tmp_path, e))?;
    file.sync_all().map_err(|e| ArtifactError::io(&tmp_path, e))?;
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(ArtifactError::io(path, e));
    }
    Ok(())
}

/// Paths and hash of one written artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenArtifact {
    pub name: &'static str,
    pub json_path: PathBuf,
    pub markdown_path: PathBuf,
    /// SHA-256 of the canonical JSON bytes
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub path: String,
    pub sha256: String,
}

/// Listing of every artifact file in a run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub kernel_version: String,
    pub generated_at: String,
    pub artifacts: Vec<IndexEntry>,
}

/// Writes artifacts into one run-scoped directory.
#[derive(Debug)]
pub struct ArtifactWriter {
    out_dir: PathBuf,
    timestamp_mode: TimestampMode,
}

impl ArtifactWriter {
    pub fn new(out_dir: impl Into<PathBuf>, timestamp_mode: TimestampMode) -> Self {
        Self {
            out_dir: out_dir.into(),
            timestamp_mode,
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn timestamp_mode(&self) -> TimestampMode {
        self.timestamp_mode
    }

    /// Serialize `artifact` into its canonical JSON bytes and Markdown text.
    pub fn encode<A: Artifact>(&self, artifact: &A) -> Result<(Vec<u8>, String), ArtifactError> {
        let meta = ArtifactMeta {
            kernel_version: KERNEL_VERSION.to_string(),
            generated_at: self.timestamp_mode.stamp(),
        };
        let mut value = serde_json::to_value(artifact)?;
        let obj = value
            .as_object_mut()
            .ok_or(ArtifactError::NotAnObject(A::NAME))?;
        obj.insert(
            "kernel_version".to_string(),
            Value::String(meta.kernel_version.clone()),
        );
        // JSON bytes feed the run-state hash, so they never carry wallclock time.
        obj.insert(
            "generated_at".to_string(),
            Value::String(DETERMINISTIC_TIMESTAMP.to_string()),
        );
        Ok((canonical_json_bytes(&value), artifact.render_markdown(&meta)))
    }

    /// Write `<NAME>.json` and `<NAME>.md`, then refresh the index.
    pub fn write<A: Artifact>(&self, artifact: &A) -> Result<WrittenArtifact, ArtifactError> {
        let (json, markdown) = self.encode(artifact)?;
        let json_path = self.out_dir.join(format!("{}.json", A::NAME));
        let markdown_path = self.out_dir.join(format!("{}.md", A::NAME));

        write_atomic(&json_path, &json)?;
        write_atomic(&markdown_path, markdown.as_bytes())?;
        let content_hash = sha256_hex(&json);

        tracing::info!(
            artifact = A::NAME,
            path = %json_path.display(),
            hash = %content_hash,
            "Artifact written"
        );

        self.write_index()?;

        Ok(WrittenArtifact {
            name: A::NAME,
            json_path,
            markdown_path,
            content_hash,
        })
    }

    /// Sorted names of the artifact files already in the directory.
    ///
    /// Dotfiles and the index itself are not artifacts. A missing directory
    /// holds none.
    pub fn existing_artifacts(&self) -> Result<Vec<String>, ArtifactError> {
        let entries = match fs::read_dir(&self.out_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ArtifactError::io(&self.out_dir, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ArtifactError::io(&self.out_dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_file = entry
                .file_type()
                .map_err(|e| ArtifactError::io(&entry.path(), e))?
                .is_file();
            if is_file && name != INDEX_FILE && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Rebuild `ARTIFACT_INDEX.json` from the files present in the directory.
    pub fn write_index(&self) -> Result<ArtifactIndex, ArtifactError> {
        let names = self.existing_artifacts()?;

        let mut artifacts = Vec::with_capacity(names.len());
        for name in names {
            let sha256 = sha256_file(&self.out_dir.join(&name))?;
            artifacts.push(IndexEntry {
                path: name.clone(),
                name,
                sha256,
            });
        }

        let index = ArtifactIndex {
            kernel_version: KERNEL_VERSION.to_string(),
            generated_at: DETERMINISTIC_TIMESTAMP.to_string(),
            artifacts,
        };
        let bytes = canonical_json_bytes(&serde_json::to_value(&index)?);
        write_atomic(&self.out_dir.join(INDEX_FILE), &bytes)?;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Sample {
        zeta: u32,
        alpha: Vec<&'static str>,
    }

    impl Artifact for Sample {
        const NAME: &'static str = "SAMPLE";

        fn render_markdown(&self, meta: &ArtifactMeta) -> String {
            format!("# Sample\n\nzeta={} at {}\n", self.zeta, meta.generated_at)
        }
    }

    #[test]
    fn canonical_bytes_sort_keys_but_not_arrays() {
        let value = json!({"b": {"y": 1, "x": 2}, "a": [3, 1, 2]});
        let text = String::from_utf8(canonical_json_bytes(&value)).unwrap();
        let a = text.find("\"a\"").unwrap();
        let b = text.find("\"b\"").unwrap();
        let x = text.find("\"x\"").unwrap();
        let y = text.find("\"y\"").unwrap();
        assert!(a < b && x < y);
        assert!(text.contains("3,\n    1,\n    2"));
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn deterministic_writes_are_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), TimestampMode::Deterministic);
        let sample = Sample {
            zeta: 7,
            alpha: vec!["b", "a"],
        };

        let first = writer.write(&sample).unwrap();
        let first_bytes = fs::read(&first.json_path).unwrap();
        let second = writer.write(&sample).unwrap();
        let second_bytes = fs::read(&second.json_path).unwrap();

        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first_bytes, second_bytes);
        let text = String::from_utf8(first_bytes).unwrap();
        assert!(text.contains(DETERMINISTIC_TIMESTAMP));
        assert!(text.contains(KERNEL_VERSION));
    }

    #[test]
    fn write_leaves_no_temp_files_and_indexes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), TimestampMode::Deterministic);
        let written = writer
            .write(&Sample {
                zeta: 1,
                alpha: vec![],
            })
            .unwrap();

        let files: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(files.iter().all(|f| !f.ends_with(".tmp")), "{files:?}");

        let index: ArtifactIndex =
            serde_json::from_slice(&fs::read(dir.path().join(INDEX_FILE)).unwrap()).unwrap();
        let names: Vec<&str> = index.artifacts.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["SAMPLE.json", "SAMPLE.md"]);
        assert_eq!(index.artifacts[0].sha256, written.content_hash);
    }

    #[test]
    fn wallclock_mode_stamps_real_time_into_markdown_only() {
        let stamp = TimestampMode::Wallclock.stamp();
        assert_ne!(stamp, DETERMINISTIC_TIMESTAMP);
        assert!(stamp.ends_with('Z'));

        let dir = tempfile::tempdir().unwrap();
        let sample = Sample {
            zeta: 3,
            alpha: vec!["a"],
        };
        let (det_json, det_md) = ArtifactWriter::new(dir.path(), TimestampMode::Deterministic)
            .encode(&sample)
            .unwrap();
        let (wall_json, wall_md) = ArtifactWriter::new(dir.path(), TimestampMode::Wallclock)
            .encode(&sample)
            .unwrap();

        assert_eq!(det_json, wall_json);
        assert!(det_md.contains(DETERMINISTIC_TIMESTAMP));
        assert!(!wall_md.contains(DETERMINISTIC_TIMESTAMP));
    }

    #[test]
    fn wallclock_writes_keep_json_and_index_bytes_stable() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path(), TimestampMode::Wallclock);
        let sample = Sample {
            zeta: 9,
            alpha: vec![],
        };

        let first = writer.write(&sample).unwrap();
        let first_bytes = fs::read(&first.json_path).unwrap();
        let index = writer.write_index().unwrap();
        let second = writer.write(&sample).unwrap();

        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first_bytes, fs::read(&second.json_path).unwrap());
        assert_eq!(index.generated_at, DETERMINISTIC_TIMESTAMP);
    }

    #[test]
    fn existing_artifacts_skips_index_and_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path().join("run"), TimestampMode::Deterministic);
        assert!(writer.existing_artifacts().unwrap().is_empty());

        writer
            .write(&Sample {
                zeta: 1,
                alpha: vec![],
            })
            .unwrap();
        fs::write(writer.out_dir().join(".lock"), b"").unwrap();
        assert_eq!(
            writer.existing_artifacts().unwrap(),
            vec!["SAMPLE.json", "SAMPLE.md"]
        );
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/file.txt");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn timestamp_mode_parses() {
        assert_eq!("wallclock".parse::<TimestampMode>(), Ok(TimestampMode::Wallclock));
        assert!("sometimes".parse::<TimestampMode>().is_err());
    }
}
