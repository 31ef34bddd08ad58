//! Metafile (build recipe) parsing
//!
//! A metafile is the YAML description of how to build one package. Unknown
//! top-level keys are ignored so recipe trees can carry annotations this
//! tool does not consume.

use crate::BuildError;
use ferrite_db::{Depends, PackageId, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Candidate recipe filenames inside a port directory.
const METAFILE_NAMES: &[&str] = &["metafile.yml", "metafile.yaml"];

/// Recipe command lists. Every phase is optional; [`Metafile`] substitutes
/// conventional defaults with `@DESTDIR@` / `@MAKEJOBS@` interpolation
/// points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Commands {
    #[serde(default)]
    pub configure: Option<Vec<String>>,
    #[serde(default)]
    pub build: Option<Vec<String>>,
    #[serde(default)]
    pub install: Option<Vec<String>>,
}

/// One package recipe from the ports tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metafile {
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub stage: Stage,

    #[serde(default)]
    pub sources: Vec<String>,

    /// Patch files, relative to the recipe directory, applied in order.
    #[serde(default)]
    pub patches: Vec<String>,

    #[serde(default)]
    pub commands: Commands,

    #[serde(default)]
    pub depends: Depends,

    #[serde(default)]
    pub provides: Vec<String>,

    #[serde(default)]
    pub install_prefix: Option<String>,

    /// Subdirectory of the extracted tree to build in, when the archive
    /// does not unpack to a single directory.
    #[serde(default)]
    pub build_dir: Option<String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub origin: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Names whose file ownership this package takes over.
    #[serde(default)]
    pub replaces: Vec<String>,
}

impl Metafile {
    pub fn id(&self) -> PackageId {
        PackageId::new(self.name.clone(), self.version.clone())
    }

    /// Parse a metafile from disk.
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let contents = std::fs::read_to_string(path).map_err(|e| BuildError::Metafile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let metafile: Self =
            serde_yaml::from_str(&contents).map_err(|e| BuildError::Metafile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if metafile.name.trim().is_empty() || metafile.version.trim().is_empty() {
            return Err(BuildError::Metafile {
                path: path.to_path_buf(),
                reason: "name and version are required".into(),
            });
        }
        Ok(metafile)
    }

    /// Locate the recipe for `name` in the ports tree.
    pub fn find(ports_dir: &Path, name: &str) -> Result<PathBuf, BuildError> {
        let port = ports_dir.join(name);
        for candidate in METAFILE_NAMES {
            let path = port.join(candidate);
            if path.exists() {
                return Ok(path);
            }
        }
        Err(BuildError::RecipeNotFound {
            name: name.to_string(),
            ports_dir: ports_dir.to_path_buf(),
        })
    }

    /// Locate and parse in one step.
    pub fn load_from_ports(ports_dir: &Path, name: &str) -> Result<(Self, PathBuf), BuildError> {
        let path = Self::find(ports_dir, name)?;
        let metafile = Self::load(&path)?;
        Ok((metafile, path))
    }

    pub fn prefix(&self) -> &str {
        self.install_prefix.as_deref().unwrap_or("/usr")
    }

    /// Configure + build command sequence, falling back to the
    /// conventional autotools dance when the recipe gives none.
    pub fn build_commands(&self) -> Vec<String> {
        let mut cmds = Vec::new();
        match &self.commands.configure {
            Some(configure) => cmds.extend(configure.iter().cloned()),
            None => cmds.push(format!("./configure --prefix={}", self.prefix())),
        }
        match &self.commands.build {
            Some(build) => cmds.extend(build.iter().cloned()),
            None => cmds.push("make -j@MAKEJOBS@".to_string()),
        }
        cmds
    }

    /// Install command sequence targeting the staging directory.
    pub fn install_commands(&self) -> Vec<String> {
        match &self.commands.install {
            Some(install) => install.clone(),
            None => vec!["make DESTDIR=@DESTDIR@ install".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECIPE: &str = r#"
name: zlib
version: "1.3.1"
sources:
  - https://example.org/zlib-1.3.1.tar.gz
patches:
  - fix-configure.patch
commands:
  configure:
    - ./configure --prefix=/usr --shared
  build:
    - make -j@MAKEJOBS@
depends:
  build: [make]
  run: []
provides: [libz]
environment:
  CFLAGS: "-O2"
origin: ports/zlib
unknown_future_key: ignored
"#;

    #[test]
    fn test_parse_full_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metafile.yml");
        std::fs::write(&path, RECIPE).unwrap();

        let m = Metafile::load(&path).unwrap();
        assert_eq!(m.id().to_string(), "zlib-1.3.1");
        assert_eq!(m.stage, Stage::Normal);
        assert_eq!(m.sources.len(), 1);
        assert_eq!(m.patches, vec!["fix-configure.patch"]);
        assert_eq!(m.depends.build, vec!["make"]);
        assert_eq!(m.provides, vec!["libz"]);
        assert_eq!(m.environment["CFLAGS"], "-O2");
    }

    #[test]
    fn test_minimal_recipe_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metafile.yml");
        std::fs::write(&path, "name: hello\nversion: \"2.12\"\n").unwrap();

        let m = Metafile::load(&path).unwrap();
        assert_eq!(m.stage, Stage::Normal);
        assert_eq!(
            m.build_commands(),
            vec!["./configure --prefix=/usr", "make -j@MAKEJOBS@"]
        );
        assert_eq!(m.install_commands(), vec!["make DESTDIR=@DESTDIR@ install"]);
    }

    #[test]
    fn test_bootstrap_stage_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metafile.yml");
        std::fs::write(&path, "name: gcc-pass1\nversion: \"13.2\"\nstage: pass1\n").unwrap();

        let m = Metafile::load(&path).unwrap();
        assert_eq!(m.stage, Stage::Pass1);
        assert!(m.stage.is_bootstrap());
    }

    #[test]
    fn test_missing_identity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metafile.yml");
        std::fs::write(&path, "name: \"\"\nversion: \"1\"\n").unwrap();
        assert!(matches!(
            Metafile::load(&path),
            Err(BuildError::Metafile { .. })
        ));
    }

    #[test]
    fn test_find_in_ports() {
        let dir = tempfile::tempdir().unwrap();
        let port = dir.path().join("zlib");
        std::fs::create_dir_all(&port).unwrap();
        std::fs::write(port.join("metafile.yml"), "name: zlib\nversion: \"1.3\"\n").unwrap();

        let found = Metafile::find(dir.path(), "zlib").unwrap();
        assert!(found.ends_with("zlib/metafile.yml"));

        assert!(matches!(
            Metafile::find(dir.path(), "missing"),
            Err(BuildError::RecipeNotFound { .. })
        ));
    }

    #[test]
    fn test_custom_install_commands_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metafile.yml");
        std::fs::write(
            &path,
            "name: busybox\nversion: \"1.36\"\ncommands:\n  install:\n    - make CONFIG_PREFIX=@DESTDIR@ install\n",
        )
        .unwrap();

        let m = Metafile::load(&path).unwrap();
        assert_eq!(
            m.install_commands(),
            vec!["make CONFIG_PREFIX=@DESTDIR@ install"]
        );
    }
}
