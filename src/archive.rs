// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Pack `src_dir` into a gzipped tarball rooted at the directory's own name,
/// so unpacking into the parent recreates it in place.
pub fn pack_dir(src_dir: &Path, archive: &Path) -> io::Result<()> {
    let root = src_dir
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no directory name"))?;

    let file = File::create(archive)?;
    let enc = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(enc);
    // The install tree contains symlinks into the mount; archive them as
    // links, not as copies of the data they point at.
    builder.follow_symlinks(false);
    builder.append_dir_all(root, src_dir)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Unpack a tarball (gzipped unless the file ends in plain `.tar`) into
/// `dest_dir`, preserving modes and symlinks.
pub fn unpack(archive: &Path, dest_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dest_dir)?;
    let file = File::open(archive)?;
    let reader: Box<dyn Read> = if archive.extension().is_some_and(|ext| ext == "tar") {
        Box::new(file)
    } else {
        Box::new(GzDecoder::new(file))
    };
    tar::Archive::new(reader).unpack(dest_dir)
}
