//! CodeDirectory blob builder.
//!
//! A CodeDirectory hashes every 4 KiB page of the signed range plus a small
//! set of "special slots" (Info.plist, requirements, CodeResources,
//! entitlements). The builder holds the special-slot *contents* rather than
//! their digests, so one builder produces both the SHA-1 and the SHA-256
//! directory.
//!
//! The encoded length depends only on the configuration and the code
//! length, which lets the signer size the whole signature before any byte
//! of the executable is hashed.

use super::constants::*;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// CodeDirectory header size for version 0x20400 (with exec segment fields)
const CODEDIRECTORY_HEADER_SIZE: usize = 88;

/// Builder for CodeDirectory blobs.
///
/// ```ignore
/// let cd = CodeDirectoryBuilder::new("com.example.app")
///     .requirements(build_requirements_blob())
///     .exec_seg_limit(0x4000)
///     .exec_seg_flags(CS_EXECSEG_MAIN_BINARY)
///     .flags(CS_ADHOC);
/// let len = cd.encoded_len(code.len(), CS_SHA256_LEN);
/// let blob = cd.build_sha256(&code);
/// assert_eq!(blob.len(), len);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CodeDirectoryBuilder {
    identifier: String,
    team_id: Option<String>,
    /// Special slot -1
    info_plist: Option<Vec<u8>>,
    /// Special slot -2
    requirements: Option<Vec<u8>>,
    /// Special slot -3
    code_resources: Option<Vec<u8>>,
    /// Special slot -5
    entitlements: Option<Vec<u8>>,
    /// Special slot -7
    der_entitlements: Option<Vec<u8>>,
    exec_seg_limit: u64,
    exec_seg_flags: u64,
    flags: u32,
}

impl CodeDirectoryBuilder {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub fn team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Raw Info.plist bytes bound to the signature.
    pub fn info_plist(mut self, data: Vec<u8>) -> Self {
        self.info_plist = Some(data);
        self
    }

    /// Requirements blob, including its header.
    pub fn requirements(mut self, blob: Vec<u8>) -> Self {
        self.requirements = Some(blob);
        self
    }

    /// Raw `_CodeSignature/CodeResources` bytes.
    pub fn code_resources(mut self, data: Vec<u8>) -> Self {
        self.code_resources = Some(data);
        self
    }

    /// XML entitlements blob, including its header.
    pub fn entitlements(mut self, blob: Vec<u8>) -> Self {
        self.entitlements = Some(blob);
        self
    }

    /// DER entitlements blob, including its header.
    pub fn der_entitlements(mut self, blob: Vec<u8>) -> Self {
        self.der_entitlements = Some(blob);
        self
    }

    /// Typically the `__TEXT` segment file size.
    pub fn exec_seg_limit(mut self, limit: u64) -> Self {
        self.exec_seg_limit = limit;
        self
    }

    pub fn exec_seg_flags(mut self, flags: u64) -> Self {
        self.exec_seg_flags = flags;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    fn is_main_executable(&self) -> bool {
        self.exec_seg_flags & CS_EXECSEG_MAIN_BINARY != 0
    }

    /// Length in bytes of the blob `build_*` returns for `code_len` bytes of code.
    pub fn encoded_len(&self, code_len: usize, hash_size: usize) -> usize {
        self.hash_offset(hash_size) + code_slot_count(code_len) * hash_size
    }

    pub fn build_sha1(&self, code: &[u8]) -> Vec<u8> {
        self.build(code, CS_HASHTYPE_SHA1, CS_SHA1_LEN)
    }

    pub fn build_sha256(&self, code: &[u8]) -> Vec<u8> {
        self.build(code, CS_HASHTYPE_SHA256, CS_SHA256_LEN)
    }

    fn strings_len(&self) -> usize {
        self.identifier.len() + 1 + self.team_id.as_ref().map_or(0, |t| t.len() + 1)
    }

    fn hash_offset(&self, hash_size: usize) -> usize {
        CODEDIRECTORY_HEADER_SIZE + self.strings_len() + self.special_slot_count() * hash_size
    }

    fn build(&self, code: &[u8], hash_type: u8, hash_size: usize) -> Vec<u8> {
        let n_special_slots = self.special_slot_count();
        let n_code_slots = code_slot_count(code.len());
        let hash_offset = self.hash_offset(hash_size);
        let total_len = self.encoded_len(code.len(), hash_size);

        let ident_offset = CODEDIRECTORY_HEADER_SIZE as u32;
        let team_offset = if self.team_id.is_some() {
            ident_offset + self.identifier.len() as u32 + 1
        } else {
            0
        };

        let mut buf = Vec::with_capacity(total_len);

        // Header, big-endian
        buf.extend(&CSMAGIC_CODEDIRECTORY.to_be_bytes());
        buf.extend(&(total_len as u32).to_be_bytes());
        buf.extend(&CODEDIRECTORY_VERSION.to_be_bytes());
        buf.extend(&self.flags.to_be_bytes());
        buf.extend(&(hash_offset as u32).to_be_bytes());
        buf.extend(&ident_offset.to_be_bytes());
        buf.extend(&(n_special_slots as u32).to_be_bytes());
        buf.extend(&(n_code_slots as u32).to_be_bytes());
        buf.extend(&(code.len() as u32).to_be_bytes()); // codeLimit
        buf.push(hash_size as u8);
        buf.push(hash_type);
        buf.push(0); // spare1
        buf.push(PAGE_SIZE_LOG2);
        buf.extend(&0u32.to_be_bytes()); // spare2
        buf.extend(&0u32.to_be_bytes()); // scatterOffset
        buf.extend(&team_offset.to_be_bytes());
        buf.extend(&0u32.to_be_bytes()); // spare3
        buf.extend(&0u64.to_be_bytes()); // codeLimit64
        buf.extend(&0u64.to_be_bytes()); // execSegBase
        buf.extend(&self.exec_seg_limit.to_be_bytes());
        buf.extend(&self.exec_seg_flags.to_be_bytes());

        buf.extend(self.identifier.as_bytes());
        buf.push(0);
        if let Some(ref team) = self.team_id {
            buf.extend(team.as_bytes());
            buf.push(0);
        }

        // Special slots run from -n up to -1
        let slots = [
            &self.der_entitlements, // -7
            &None,                  // -6
            &self.entitlements,     // -5
            &None,                  // -4
            &self.code_resources,   // -3
            &self.requirements,     // -2
            &self.info_plist,       // -1
        ];
        for slot in &slots[slots.len() - n_special_slots..] {
            match slot {
                Some(data) => buf.extend(digest(hash_type, data)),
                None => buf.extend(std::iter::repeat(0u8).take(hash_size)),
            }
        }

        for page in code.chunks(PAGE_SIZE) {
            buf.extend(digest(hash_type, page));
        }

        buf
    }

    /// Number of special slots, with empty leading slots trimmed.
    ///
    /// Slots -7 and -6 only exist for main executables. At least slots -1
    /// through -3 are always present.
    fn special_slot_count(&self) -> usize {
        let mut present: Vec<bool> = Vec::with_capacity(7);
        if self.is_main_executable() {
            present.push(self.der_entitlements.is_some());
            present.push(false);
        }
        present.push(self.entitlements.is_some());
        present.push(false);
        present.push(self.code_resources.is_some());
        present.push(self.requirements.is_some());
        present.push(self.info_plist.is_some());

        match present.iter().position(|&p| p) {
            Some(idx) => (present.len() - idx).max(3),
            None => 3,
        }
    }
}

fn code_slot_count(code_len: usize) -> usize {
    code_len.div_ceil(PAGE_SIZE)
}

fn digest(hash_type: u8, data: &[u8]) -> Vec<u8> {
    if hash_type == CS_HASHTYPE_SHA1 {
        Sha1::digest(data).to_vec()
    } else {
        Sha256::digest(data).to_vec()
    }
}
