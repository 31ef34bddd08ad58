//! Package archive creation and deployment
//!
//! The staged tree is archived as `name-version-arch.tar.zst` into the
//! package cache; deployment unpacks that archive into the target root
//! (`/` for normal packages, the bootstrap root for pass1/pass2).

use crate::BuildError;
use ferrite_db::PackageId;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Canonical archive filename for a package on this machine.
pub fn package_file_name(id: &PackageId) -> String {
    format!("{id}-{}.tar.zst", std::env::consts::ARCH)
}

/// Archive the staging directory. Returns the archive path.
pub fn create_package(
    destdir: &Path,
    cache_packages_dir: &Path,
    id: &PackageId,
) -> Result<PathBuf, BuildError> {
    fs::create_dir_all(cache_packages_dir)?;
    let archive = cache_packages_dir.join(package_file_name(id));

    let file = fs::File::create(&archive)?;
    let encoder = zstd::stream::write::Encoder::new(file, 0)?.auto_finish();
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", destdir)?;
    builder.finish()?;

    info!("Packaged {} -> {}", id, archive.display());
    Ok(archive)
}

/// Unpack a package archive into the target root.
pub fn deploy_package(archive: &Path, root: &Path) -> Result<(), BuildError> {
    fs::create_dir_all(root)?;

    let file = fs::File::open(archive)?;
    let name = archive.to_string_lossy();

    if name.ends_with(".tar.zst") {
        let decoder = zstd::stream::read::Decoder::new(file)?;
        unpack(decoder, archive, root)?;
    } else {
        unpack(file, archive, root)?;
    }

    info!("Deployed {} into {}", archive.display(), root.display());
    Ok(())
}

fn unpack<R: std::io::Read>(reader: R, archive: &Path, root: &Path) -> Result<(), BuildError> {
    let mut tar = tar::Archive::new(reader);
    tar.set_overwrite(true);
    tar.set_preserve_permissions(true);
    tar.unpack(root).map_err(|e| BuildError::ExtractFailed {
        archive: archive.to_path_buf(),
        reason: e.to_string(),
    })
}
