//! Installed-package manifest types

use crate::DbError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Bootstrap stage a package was built for.
///
/// `pass1`/`pass2` packages deploy into the LFS staging root; `normal`
/// packages deploy into `/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pass1,
    Pass2,
    #[default]
    Normal,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Pass1 => "pass1",
            Stage::Pass2 => "pass2",
            Stage::Normal => "normal",
        }
    }

    /// Whether packages of this stage deploy into the bootstrap root.
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, Stage::Pass1 | Stage::Pass2)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass1" => Ok(Stage::Pass1),
            "pass2" => Ok(Stage::Pass2),
            "normal" => Ok(Stage::Normal),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// Identity of one package: `(name, version)`, canonical form `name-version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId {
    pub name: String,
    pub version: String,
}

impl PackageId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Split a canonical `name-version` token at its last dash.
    ///
    /// Package names may themselves contain dashes, so this is only used on
    /// strings produced by [`PackageId::to_string`] (manifest filenames,
    /// snapshot directories). Returns `None` when there is no dash or either
    /// half is empty.
    pub fn parse(s: &str) -> Option<Self> {
        let idx = s.rfind('-')?;
        let (name, version) = (&s[..idx], &s[idx + 1..]);
        if name.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self::new(name, version))
    }

    /// Stable manifest filename for this identity.
    pub fn manifest_file(&self) -> String {
        format!("{self}.json")
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

/// One file owned by a package.
///
/// The manifest format accepts either a bare path string or a record with
/// checksum metadata; both forms round-trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileEntry {
    Path(String),
    Detailed {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
}

impl FileEntry {
    pub fn path(&self) -> &str {
        match self {
            FileEntry::Path(p) => p,
            FileEntry::Detailed { path, .. } => path,
        }
    }

    pub fn sha256(&self) -> Option<&str> {
        match self {
            FileEntry::Path(_) => None,
            FileEntry::Detailed { sha256, .. } => sha256.as_deref(),
        }
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            FileEntry::Path(_) => None,
            FileEntry::Detailed { size, .. } => *size,
        }
    }
}

/// Build- and run-time dependency lists.
///
/// Entries are dependency tokens, optionally carrying a version predicate
/// (`zlib>=1.3`). Matching strips the predicate; see [`dep_name`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Depends {
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub run: Vec<String>,
}

impl Depends {
    /// Build and run tokens, in that order.
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.build.iter().chain(self.run.iter()).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.build.is_empty() && self.run.is_empty()
    }
}

/// Strip the version predicate from a dependency token.
///
/// `zlib>=1.3` → `zlib`. Predicates are parsed but never evaluated;
/// dependency resolution is by unqualified name only.
pub fn dep_name(token: &str) -> &str {
    match token.find(|c| matches!(c, '<' | '>' | '=' | '!')) {
        Some(idx) => token[..idx].trim(),
        None => token.trim(),
    }
}

/// Canonical record of one installed package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub stage: Stage,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_prefix: Option<String>,

    pub files: Vec<FileEntry>,

    #[serde(default)]
    pub depends: Depends,

    #[serde(default)]
    pub provides: Vec<String>,

    /// Names whose file ownership this package may take over on install.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replaces: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_date: Option<String>,
}

impl Manifest {
    pub fn id(&self) -> PackageId {
        PackageId::new(self.name.clone(), self.version.clone())
    }

    /// Check the required-field contract (`name`, `version`, `files` are
    /// required; `files` may be empty but must be present, which serde
    /// already enforces).
    pub fn validate(&self) -> Result<(), DbError> {
        if self.name.trim().is_empty() {
            return Err(DbError::Malformed {
                path: self.id().manifest_file().into(),
                reason: "empty name".into(),
            });
        }
        if self.version.trim().is_empty() {
            return Err(DbError::Malformed {
                path: self.id().manifest_file().into(),
                reason: "empty version".into(),
            });
        }
        Ok(())
    }

    /// Load a manifest from a JSON file.
    pub fn load(path: &Path) -> Result<Self, DbError> {
        let contents = std::fs::read_to_string(path)?;
        let manifest: Self = serde_json::from_str(&contents).map_err(|e| DbError::Malformed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Whether `name` satisfies a dependency on this package, either by
    /// identity or through `provides`.
    pub fn satisfies(&self, name: &str) -> bool {
        self.name == name || self.provides.iter().any(|p| dep_name(p) == name)
    }

    /// Paths of every owned file.
    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(FileEntry::path)
    }
}
