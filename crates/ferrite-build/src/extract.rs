//! Source archive extraction
//!
//! Gzip, zstd and plain tarballs are unpacked natively; xz/bzip2 tarballs
//! and zip files go through the system `tar`/`unzip`, with `tar -xf` as the
//! final fallback for anything unrecognized.

use crate::BuildError;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

/// Unpack one archive into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<(), BuildError> {
    fs::create_dir_all(dest)?;
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let file = fs::File::open(archive)?;
        let decoder = flate2::read::GzDecoder::new(file);
        unpack_tar(decoder, archive, dest)?;
    } else if name.ends_with(".tar.zst") {
        let file = fs::File::open(archive)?;
        let decoder = zstd::stream::read::Decoder::new(file)?;
        unpack_tar(decoder, archive, dest)?;
    } else if name.ends_with(".tar") {
        let file = fs::File::open(archive)?;
        unpack_tar(file, archive, dest)?;
    } else if name.ends_with(".zip") {
        run_extractor("unzip", &["-qo"], archive, dest, &["-d"])?;
    } else {
        // covers .tar.xz, .tar.bz2 and anything else tar understands
        run_extractor("tar", &["-xf"], archive, dest, &["-C"])?;
    }

    info!("Extracted {} into {}", archive.display(), dest.display());
    Ok(())
}

/// Unpack every archive of a package into the same work directory.
pub fn extract_all(archives: &[std::path::PathBuf], dest: &Path) -> Result<(), BuildError> {
    for archive in archives {
        extract_archive(archive, dest)?;
    }
    Ok(())
}

fn unpack_tar<R: std::io::Read>(reader: R, archive: &Path, dest: &Path) -> Result<(), BuildError> {
    let mut tar = tar::Archive::new(reader);
    tar.set_overwrite(true);
    tar.unpack(dest).map_err(|e| BuildError::ExtractFailed {
        archive: archive.to_path_buf(),
        reason: e.to_string(),
    })
}

fn run_extractor(
    tool: &str,
    pre_args: &[&str],
    archive: &Path,
    dest: &Path,
    dest_flag: &[&str],
) -> Result<(), BuildError> {
    debug!("Extracting {} with {}", archive.display(), tool);
    let output = Command::new(tool)
        .args(pre_args)
        .arg(archive)
        .args(dest_flag)
        .arg(dest)
        .output()
        .map_err(|e| BuildError::ExtractFailed {
            archive: archive.to_path_buf(),
            reason: format!("{tool}: {e}"),
        })?;

    if !output.status.success() {
        return Err(BuildError::ExtractFailed {
            archive: archive.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }
    Ok(())
}
