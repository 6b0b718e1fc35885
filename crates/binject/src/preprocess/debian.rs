//! Debian package unpacking.
//!
//! A `.deb` is an `ar` archive holding `debian-binary`, `control.tar.*` and
//! `data.tar.*`. Only the data member is unpacked.

use super::AssetKind;
use crate::error::IoResultExt;
use crate::{Error, Result};
use flate2::read::GzDecoder;
use goblin::archive::Archive;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;
use xz2::read::XzDecoder;
use xz2::stream::Stream;

/// Compression of the `data.tar*` member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataCompression {
    None,
    Gzip,
    Xz,
    Lzma,
    Zstd,
}

impl DataCompression {
    fn from_member_name(name: &str) -> Option<Self> {
        match name.strip_prefix("data.tar")? {
            "" => Some(Self::None),
            ".gz" => Some(Self::Gzip),
            ".xz" => Some(Self::Xz),
            ".lzma" => Some(Self::Lzma),
            ".zst" => Some(Self::Zstd),
            _ => None,
        }
    }

    fn decoder<'a>(self, data: &'a [u8]) -> io::Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::None => Box::new(data),
            Self::Gzip => Box::new(GzDecoder::new(data)),
            Self::Xz => Box::new(XzDecoder::new(data)),
            Self::Lzma => {
                let stream = Stream::new_lzma_decoder(u64::MAX).map_err(io::Error::other)?;
                Box::new(XzDecoder::new_stream(data, stream))
            }
            Self::Zstd => Box::new(zstd::stream::read::Decoder::new(data)?),
        })
    }
}

/// Unpack the data member of `package` into `dest_dir`.
pub fn unpack_data(package: &Path, dest_dir: &Path) -> Result<()> {
    let bytes = fs::read(package).at("read", package)?;
    let archive = Archive::parse(&bytes)
        .map_err(|e| Error::package(package, format!("not an ar archive: {e}")))?;

    let member = archive
        .members()
        .into_iter()
        .find(|name| name.starts_with("data.tar"))
        .ok_or_else(|| Error::package(package, "no data.tar member"))?;

    let compression = DataCompression::from_member_name(member).ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported compression of member {member}"),
        ))
    })?;

    let data = archive
        .extract(member, &bytes)
        .map_err(|e| Error::package(package, format!("truncated member {member}: {e}")))?;

    debug!(package = %package.display(), member, ?compression, "Unpacking package data");
    fs::create_dir_all(dest_dir).at("create", dest_dir)?;
    let reader = compression.decoder(data).at("decompress", package)?;
    tar::Archive::new(reader)
        .unpack(dest_dir)
        .at("unpack", package)?;
    Ok(())
}

/// Plug-ins found below `root`, sorted by path.
///
/// Matched frameworks and bundles are not descended into, so nested
/// frameworks of a bundle travel with it.
pub fn collect_assets(root: &Path) -> Result<Vec<(PathBuf, AssetKind)>> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(io::Error::from).at("walk", root)?;
        if entry.depth() == 0 {
            continue;
        }
        let Some(kind) = AssetKind::from_path(entry.path()) else {
            continue;
        };

        let file_type = entry.file_type();
        let expected = match kind {
            AssetKind::Dylib => file_type.is_file(),
            AssetKind::Framework | AssetKind::Bundle => file_type.is_dir(),
        };
        if file_type.is_dir() {
            walker.skip_current_dir();
        }
        if expected {
            found.push((entry.into_path(), kind));
        } else {
            debug!(path = %entry.path().display(), "Skipping entry of unexpected type");
        }
    }

    Ok(found)
}
