//! Fixtures shared by the integration tests: synthetic app bundles with
//! signed Mach-O executables, and plug-in archives.

#![allow(dead_code)]

use binject::macho::{MachOFile, SliceLayout};
use binject::{
    AdhocSigner, AppBundle, Injector, InjectorConfig, MachOPatcher, SignError, Signer,
    SigningIdentity,
};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub const LIBSYSTEM: &str = "/usr/lib/libSystem.B.dylib";

const TEXT_VMADDR: u64 = 0x1_0000_0000;
const ARM64: (u32, u32) = (0x0100_000c, 0);
const X86_64: (u32, u32) = (0x0100_0007, 3);

fn put_u32s(buf: &mut Vec<u8>, values: &[u32]) {
    for v in values {
        buf.extend(v.to_le_bytes());
    }
}

fn put_u64s(buf: &mut Vec<u8>, values: &[u64]) {
    for v in values {
        buf.extend(v.to_le_bytes());
    }
}

fn name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

fn align(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

/// Unsigned MH_EXECUTE: `__TEXT` covering `0..0x4000` with `__text` at
/// `text_offset`, `__LINKEDIT` at `0x4000..0x4100`, then `dylibs`.
pub fn unsigned_executable(cpu: (u32, u32), dylibs: &[&str], text_offset: u32) -> Vec<u8> {
    let mut cmds = Vec::new();

    put_u32s(&mut cmds, &[0x19, 152]);
    cmds.extend(name16("__TEXT"));
    put_u64s(&mut cmds, &[TEXT_VMADDR, 0x4000, 0, 0x4000]);
    put_u32s(&mut cmds, &[5, 5, 1, 0]);
    cmds.extend(name16("__text"));
    cmds.extend(name16("__TEXT"));
    put_u64s(&mut cmds, &[TEXT_VMADDR + text_offset as u64, 0x20]);
    put_u32s(&mut cmds, &[text_offset, 2, 0, 0, 0x8000_0400, 0, 0, 0]);

    put_u32s(&mut cmds, &[0x19, 72]);
    cmds.extend(name16("__LINKEDIT"));
    put_u64s(&mut cmds, &[TEXT_VMADDR + 0x4000, 0x4000, 0x4000, 0x100]);
    put_u32s(&mut cmds, &[1, 1, 0, 0]);

    for name in dylibs {
        let cmdsize = align(24 + name.len() + 1, 8);
        put_u32s(&mut cmds, &[0xc, cmdsize as u32, 24, 2, 0x10000, 0x10000]);
        cmds.extend(name.as_bytes());
        cmds.resize(cmds.len() + cmdsize - 24 - name.len(), 0);
    }

    let ncmds = 2 + dylibs.len() as u32;
    let mut out = Vec::with_capacity(0x4100);
    put_u32s(
        &mut out,
        &[0xfeed_facf, cpu.0, cpu.1, 2, ncmds, cmds.len() as u32, 0x0020_0085, 0],
    );
    out.extend(cmds);
    assert!(out.len() <= text_offset as usize, "fixture header too large");

    out.resize(text_offset as usize, 0);
    out.resize(0x4000, 0xd5);
    out.resize(0x4100, 0xaa);
    out
}

/// Universal binary from already built slices, 2^14 aligned.
pub fn fat(slices: &[((u32, u32), Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(0xcafe_babeu32.to_be_bytes());
    out.extend((slices.len() as u32).to_be_bytes());

    let mut offset = 0x4000usize;
    let mut offsets = Vec::new();
    for ((cputype, cpusubtype), bytes) in slices {
        for v in [*cputype, *cpusubtype, offset as u32, bytes.len() as u32, 14] {
            out.extend(v.to_be_bytes());
        }
        offsets.push(offset);
        offset = align(offset + bytes.len(), 0x4000);
    }
    for ((_, bytes), at) in slices.iter().zip(offsets) {
        out.resize(at, 0);
        out.extend(bytes);
    }
    out
}

/// Signer that always fails.
pub struct FailingSigner;

impl Signer for FailingSigner {
    fn sign_slice(&self, _slice: &[u8], _identity: &SigningIdentity) -> Result<Vec<u8>, SignError> {
        Err(SignError::Rejected("forced signing failure".into()))
    }
}

/// Temporary container holding `Demo.app` plus backup, log and staging
/// directories.
pub struct Fixture {
    pub dir: TempDir,
    pub app: AppBundle,
}

impl Fixture {
    /// Thin arm64 app linking libSystem, signed ad hoc.
    pub fn new() -> Self {
        Self::build(|identity| {
            sign(unsigned_executable(ARM64, &[LIBSYSTEM], 0x3000), identity)
        })
    }

    /// Thin app whose `__text` starts at `text_offset`.
    pub fn with_text_offset(text_offset: u32) -> Self {
        Self::build(|identity| {
            sign(unsigned_executable(ARM64, &[LIBSYSTEM], text_offset), identity)
        })
    }

    /// Thin app linking `dylibs`.
    pub fn with_dylibs(dylibs: &[&str]) -> Self {
        Self::build(|identity| sign(unsigned_executable(ARM64, dylibs, 0x3000), identity))
    }

    /// Thin app whose signature area is `extra` bytes larger than an
    /// ad-hoc signature needs, as with CMS-signed store binaries.
    pub fn with_reserved_signature(extra: u32) -> Self {
        Self::build(|identity| {
            reserve_signature(sign(unsigned_executable(ARM64, &[LIBSYSTEM], 0x3000), identity), extra)
        })
    }

    /// Universal arm64 + x86_64 app.
    pub fn universal() -> Self {
        Self::build(|identity| {
            fat(&[
                (ARM64, sign(unsigned_executable(ARM64, &[LIBSYSTEM], 0x3000), identity)),
                (X86_64, sign(unsigned_executable(X86_64, &[LIBSYSTEM], 0x3000), identity)),
            ])
        })
    }

    fn build(executable: impl FnOnce(&SigningIdentity) -> Vec<u8>) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("Demo.app");
        fs::create_dir_all(&root).unwrap();

        let mut info = plist::Dictionary::new();
        info.insert("CFBundleExecutable".into(), "Demo".into());
        info.insert("CFBundleIdentifier".into(), "com.example.demo".into());
        info.insert("CFBundleName".into(), "Demo".into());
        plist::Value::Dictionary(info)
            .to_file_xml(root.join("Info.plist"))
            .unwrap();

        let app = AppBundle::from_bundle_root(&root).unwrap();
        let bytes = executable(&SigningIdentity::for_app(&app));
        fs::write(&app.executable, bytes).unwrap();

        Self { dir, app }
    }

    pub fn root(&self) -> &Path {
        &self.app.root
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.path().join("staging")
    }

    pub fn inputs_dir(&self) -> PathBuf {
        let dir = self.dir.path().join("inputs");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub fn config(&self) -> InjectorConfig {
        InjectorConfig::new()
            .backups_dir(self.backups_dir())
            .logs_dir(self.dir.path().join("logs"))
            .staging_root(self.staging_dir())
    }

    pub fn injector(&self) -> Injector {
        Injector::new(self.app.clone(), self.config())
    }

    pub fn executable_bytes(&self) -> Vec<u8> {
        fs::read(&self.app.executable).unwrap()
    }

    /// Dylib paths of the first slice.
    pub fn load_paths(&self) -> Vec<String> {
        MachOPatcher::new(Arc::new(AdhocSigner), SigningIdentity::default())
            .load_references(&self.app.executable)
            .unwrap()
            .into_iter()
            .map(|r| r.path().to_string())
            .collect()
    }

    /// Whether every slice loads `path`.
    pub fn every_slice_loads(&self, path: &str) -> bool {
        let file = MachOFile::parse(self.executable_bytes()).unwrap();
        file.slices().iter().all(|slice| {
            SliceLayout::parse(file.slice_bytes(slice))
                .unwrap()
                .find_dylib(path)
                .is_some()
        })
    }

    /// Loose dylib input.
    pub fn dylib(&self, name: &str) -> PathBuf {
        let path = self.inputs_dir().join(name);
        fs::write(&path, format!("dylib {name}")).unwrap();
        path
    }

    /// Loose framework input whose executable is `Info.plist`'s
    /// `CFBundleExecutable`.
    pub fn framework(&self, name: &str, executable: &str) -> PathBuf {
        let path = self.inputs_dir().join(name);
        fs::create_dir_all(&path).unwrap();
        let mut info = plist::Dictionary::new();
        info.insert("CFBundleExecutable".into(), executable.into());
        plist::Value::Dictionary(info)
            .to_file_xml(path.join("Info.plist"))
            .unwrap();
        fs::write(path.join(executable), b"framework binary").unwrap();
        path
    }

    /// Zip input holding `files`.
    pub fn zip(&self, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = self.inputs_dir().join(name);
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        for (entry, data) in files {
            zip.start_file(*entry, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    /// Debian package whose gzip data member holds `files`.
    pub fn deb(&self, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let mut tar = tar::Builder::new(Vec::new());
        for (entry, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            tar.append_data(&mut header, entry, *data).unwrap();
        }
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&tar.into_inner().unwrap()).unwrap();
        let data = gz.finish().unwrap();

        let mut out = b"!<arch>\n".to_vec();
        for (member, body) in [("debian-binary", &b"2.0\n"[..]), ("data.tar.gz", &data[..])] {
            out.extend(format!("{member:<16}{:<12}{:<6}{:<6}{:<8}{:<10}`\n", 0, 0, 0, 100644, body.len()).as_bytes());
            out.extend(body);
            if body.len() % 2 == 1 {
                out.push(b'\n');
            }
        }

        let path = self.inputs_dir().join(name);
        fs::write(&path, out).unwrap();
        path
    }
}

/// Sign a thin slice the way the injector will re-sign it.
pub fn sign(slice: Vec<u8>, identity: &SigningIdentity) -> Vec<u8> {
    AdhocSigner.sign_slice(&slice, identity).unwrap()
}

/// Grow a signed slice's `LC_CODE_SIGNATURE` datasize and `__LINKEDIT`
/// filesize by `extra` zero bytes.
pub fn reserve_signature(mut slice: Vec<u8>, extra: u32) -> Vec<u8> {
    let layout = SliceLayout::parse(&slice).unwrap();
    let cs = layout.code_signature.unwrap();
    let linkedit = layout.linkedit.unwrap();

    let datasize = cs.offset + 12;
    slice[datasize..datasize + 4].copy_from_slice(&(cs.datasize + extra).to_le_bytes());
    let filesize = linkedit.offset + 48;
    slice[filesize..filesize + 8]
        .copy_from_slice(&(linkedit.filesize + extra as u64).to_le_bytes());
    slice.resize(slice.len() + extra as usize, 0);
    slice
}

/// Entry names of a zip archive.
pub fn zip_names(path: &Path) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    names
}

/// Names of the entries of `dir`, sorted; empty when it does not exist.
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
