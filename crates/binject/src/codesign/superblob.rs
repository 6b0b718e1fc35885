//! SuperBlob assembly and lookup.
//!
//! The SuperBlob is the top-level container of an embedded signature: a
//! 12-byte header (magic, length, count), `count` index entries of
//! `(slot_type, offset)`, then the blobs themselves. Everything is
//! big-endian.

use super::constants::*;

/// Size of the SuperBlob header in bytes (magic + length + count)
const SUPERBLOB_HEADER_SIZE: usize = 12;

/// Size of each index entry in bytes (slot_type + offset)
const INDEX_ENTRY_SIZE: usize = 8;

/// A blob tagged with its SuperBlob slot.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub slot_type: u32,
    /// Raw blob data, including its own magic and length header.
    pub data: Vec<u8>,
}

impl BlobEntry {
    pub fn new(slot_type: u32, data: Vec<u8>) -> Self {
        Self { slot_type, data }
    }
}

/// Length of a SuperBlob holding blobs of the given lengths.
pub fn encoded_len(blob_lens: &[usize]) -> usize {
    SUPERBLOB_HEADER_SIZE + blob_lens.len() * INDEX_ENTRY_SIZE + blob_lens.iter().sum::<usize>()
}

/// Serialize `entries` in order.
pub fn build_superblob(entries: Vec<BlobEntry>) -> Vec<u8> {
    let lens: Vec<usize> = entries.iter().map(|e| e.data.len()).collect();
    let total_length = encoded_len(&lens);

    let mut buf = Vec::with_capacity(total_length);
    buf.extend(&CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
    buf.extend(&(total_length as u32).to_be_bytes());
    buf.extend(&(entries.len() as u32).to_be_bytes());

    let mut offset = SUPERBLOB_HEADER_SIZE + entries.len() * INDEX_ENTRY_SIZE;
    for entry in &entries {
        buf.extend(&entry.slot_type.to_be_bytes());
        buf.extend(&(offset as u32).to_be_bytes());
        offset += entry.data.len();
    }

    for entry in entries {
        buf.extend(entry.data);
    }

    buf
}

/// Find the blob stored under `slot_type` in a serialized SuperBlob.
///
/// Returns the whole blob including its header, or `None` when the input
/// is not a SuperBlob or the slot is absent or out of bounds.
pub fn find_blob(superblob: &[u8], slot_type: u32) -> Option<&[u8]> {
    if read_be32(superblob, 0)? != CSMAGIC_EMBEDDED_SIGNATURE {
        return None;
    }
    let count = read_be32(superblob, 8)? as usize;

    for i in 0..count {
        let entry = SUPERBLOB_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
        if read_be32(superblob, entry)? != slot_type {
            continue;
        }
        let offset = read_be32(superblob, entry + 4)? as usize;
        let length = read_be32(superblob, offset + 4)? as usize;
        return superblob.get(offset..offset.checked_add(length)?);
    }
    None
}

fn read_be32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

/// Empty requirement set.
pub fn build_requirements_blob() -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend(&CSMAGIC_REQUIREMENTS.to_be_bytes());
    buf.extend(&12u32.to_be_bytes());
    buf.extend(&0u32.to_be_bytes());
    buf
}

pub fn build_entitlements_blob(plist_data: &[u8]) -> Vec<u8> {
    wrap(CSMAGIC_EMBEDDED_ENTITLEMENTS, plist_data)
}

/// Empty CMS wrapper; ad-hoc signatures carry no signer.
pub fn build_adhoc_signature_blob() -> Vec<u8> {
    wrap(CSMAGIC_BLOBWRAPPER, &[])
}

fn wrap(magic: u32, payload: &[u8]) -> Vec<u8> {
    let total_len = 8 + payload.len() as u32;
    let mut buf = Vec::with_capacity(total_len as usize);
    buf.extend(&magic.to_be_bytes());
    buf.extend(&total_len.to_be_bytes());
    buf.extend(payload);
    buf
}

/// Collects signature components and emits them in slot order:
/// CodeDirectory (SHA-1), requirements, entitlements, DER entitlements,
/// alternate CodeDirectory (SHA-256), signature wrapper.
#[derive(Debug, Default)]
pub struct SuperBlobBuilder {
    code_directory_sha1: Option<Vec<u8>>,
    code_directory_sha256: Option<Vec<u8>>,
    requirements: Option<Vec<u8>>,
    entitlements: Option<Vec<u8>>,
    der_entitlements: Option<Vec<u8>>,
    signature: Option<Vec<u8>>,
}

impl SuperBlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code_directory_sha1(mut self, cd: Vec<u8>) -> Self {
        self.code_directory_sha1 = Some(cd);
        self
    }

    pub fn code_directory_sha256(mut self, cd: Vec<u8>) -> Self {
        self.code_directory_sha256 = Some(cd);
        self
    }

    pub fn requirements(mut self, req: Vec<u8>) -> Self {
        self.requirements = Some(req);
        self
    }

    pub fn entitlements(mut self, ent: Vec<u8>) -> Self {
        self.entitlements = Some(ent);
        self
    }

    pub fn der_entitlements(mut self, der_ent: Vec<u8>) -> Self {
        self.der_entitlements = Some(der_ent);
        self
    }

    pub fn signature(mut self, sig: Vec<u8>) -> Self {
        self.signature = Some(sig);
        self
    }

    fn entries(self) -> Vec<BlobEntry> {
        let slots = [
            (CSSLOT_CODEDIRECTORY, self.code_directory_sha1),
            (CSSLOT_REQUIREMENTS, self.requirements),
            (CSSLOT_ENTITLEMENTS, self.entitlements),
            (CSSLOT_DER_ENTITLEMENTS, self.der_entitlements),
            (CSSLOT_ALTERNATE_CODEDIRECTORIES, self.code_directory_sha256),
            (CSSLOT_SIGNATURESLOT, self.signature),
        ];
        slots
            .into_iter()
            .filter_map(|(slot, data)| data.map(|d| BlobEntry::new(slot, d)))
            .collect()
    }

    pub fn build(self) -> Vec<u8> {
        build_superblob(self.entries())
    }
}
