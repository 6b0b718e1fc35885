//! Ad-hoc re-signing of patched slices.
//!
//! Any edit to the load commands invalidates the page hashes of the
//! embedded signature, so every changed slice passes through a [`Signer`]
//! before it is written. [`AdhocSigner`] produces the same layout as
//! `codesign -s -`: SHA-1 and SHA-256 CodeDirectories, an empty
//! requirement set, preserved entitlements and an empty CMS wrapper.
//!
//! The signature is sized before anything is hashed. `LC_CODE_SIGNATURE`
//! and `__LINKEDIT` are rewritten to their final values first, so the
//! hashed header pages are exactly the bytes that end up in the file.

use super::parser::SliceLayout;
use super::writer::{write_u32_le, write_u64_le};
use super::{align_to, SignError, LC_CODE_SIGNATURE, LINKEDIT_DATA_COMMAND_SIZE};
use crate::app::AppBundle;
use crate::codesign::constants::*;
use crate::codesign::superblob::{
    self, build_adhoc_signature_blob, build_requirements_blob, find_blob, SuperBlobBuilder,
};
use crate::codesign::CodeDirectoryBuilder;
use std::fs;

/// Offsets inside segment_command_64
const SEGMENT_VMSIZE_OFFSET: usize = 32;
const SEGMENT_FILESIZE_OFFSET: usize = 48;

/// Offsets inside mach_header_64
const HEADER_NCMDS_OFFSET: usize = 16;
const HEADER_SIZEOFCMDS_OFFSET: usize = 20;

/// `__LINKEDIT` vmsize granularity (16 KiB pages)
const LINKEDIT_PAGE_SIZE: usize = 0x4000;

/// Who the signature is issued for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SigningIdentity {
    /// CodeDirectory identifier, normally the bundle identifier.
    pub identifier: String,
    /// Omitted from the signature when `None` or empty.
    pub team_id: Option<String>,
    /// Bound through special slot -1.
    pub info_plist: Option<Vec<u8>>,
    /// Bound through special slot -3.
    pub code_resources: Option<Vec<u8>>,
}

impl SigningIdentity {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    pub fn with_team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Identity of an application's main executable.
    ///
    /// Binds the bundle's `Info.plist` and `_CodeSignature/CodeResources`
    /// when they exist.
    pub fn for_app(app: &AppBundle) -> Self {
        Self {
            identifier: app.bundle_id.clone(),
            team_id: app.team_id.clone().filter(|t| !t.is_empty()),
            info_plist: fs::read(app.root.join("Info.plist")).ok(),
            code_resources: fs::read(app.root.join("_CodeSignature").join("CodeResources")).ok(),
        }
    }
}

/// Produces a signed copy of one thin Mach-O slice.
pub trait Signer: Send + Sync {
    fn sign_slice(&self, slice: &[u8], identity: &SigningIdentity) -> Result<Vec<u8>, SignError>;
}

/// Default [`Signer`]: embedded ad-hoc signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdhocSigner;

impl Signer for AdhocSigner {
    fn sign_slice(&self, slice: &[u8], identity: &SigningIdentity) -> Result<Vec<u8>, SignError> {
        let layout = SliceLayout::parse(slice).map_err(|e| SignError::Malformed(e.to_string()))?;
        let linkedit = layout.linkedit.ok_or(SignError::MissingLinkedit)?;
        let text_filesize = layout.text_filesize.ok_or(SignError::MissingText)?;

        let linkedit_end = (linkedit.fileoff + linkedit.filesize) as usize;
        if linkedit_end > slice.len() {
            return Err(SignError::Malformed(
                "__LINKEDIT extends past end of slice".into(),
            ));
        }

        let (entitlements, der_entitlements) = preserved_entitlements(slice, &layout);

        let (mut out, cs_offset, dataoff) = match layout.code_signature {
            Some(cs) => {
                let dataoff = cs.dataoff as usize;
                if (dataoff as u64) < linkedit.fileoff || dataoff > slice.len() {
                    return Err(SignError::Malformed(
                        "code signature outside __LINKEDIT".into(),
                    ));
                }
                (slice[..dataoff].to_vec(), cs.offset, dataoff)
            }
            None => {
                let available = layout.header_padding();
                if available < LINKEDIT_DATA_COMMAND_SIZE {
                    return Err(SignError::NoRoomForSignatureCommand {
                        needed: LINKEDIT_DATA_COMMAND_SIZE,
                        available,
                    });
                }
                let dataoff = align_to(linkedit_end, 16);
                let mut out = slice[..linkedit_end].to_vec();
                out.resize(dataoff, 0);

                let at = layout.load_commands_end();
                write_u32_le(&mut out, at, LC_CODE_SIGNATURE);
                write_u32_le(&mut out, at + 4, LINKEDIT_DATA_COMMAND_SIZE as u32);
                write_u32_le(&mut out, HEADER_NCMDS_OFFSET, layout.ncmds + 1);
                write_u32_le(
                    &mut out,
                    HEADER_SIZEOFCMDS_OFFSET,
                    layout.sizeofcmds + LINKEDIT_DATA_COMMAND_SIZE as u32,
                );
                (out, at, dataoff)
            }
        };

        let mut cd = CodeDirectoryBuilder::new(identity.identifier.as_str())
            .requirements(build_requirements_blob())
            .exec_seg_limit(text_filesize)
            .flags(CS_ADHOC);
        if layout.is_executable {
            cd = cd.exec_seg_flags(CS_EXECSEG_MAIN_BINARY);
        }
        if let Some(team) = identity.team_id.as_deref().filter(|t| !t.is_empty()) {
            cd = cd.team_id(team);
        }
        if let Some(info) = &identity.info_plist {
            cd = cd.info_plist(info.clone());
        }
        if let Some(resources) = &identity.code_resources {
            cd = cd.code_resources(resources.clone());
        }
        if let Some(ent) = &entitlements {
            cd = cd.entitlements(ent.clone());
        }
        if let Some(der) = &der_entitlements {
            cd = cd.der_entitlements(der.clone());
        }

        let mut blob_lens = vec![
            cd.encoded_len(dataoff, CS_SHA1_LEN),
            build_requirements_blob().len(),
        ];
        blob_lens.extend(entitlements.as_ref().map(Vec::len));
        blob_lens.extend(der_entitlements.as_ref().map(Vec::len));
        blob_lens.push(cd.encoded_len(dataoff, CS_SHA256_LEN));
        blob_lens.push(build_adhoc_signature_blob().len());

        let signature_len = superblob::encoded_len(&blob_lens);
        let needed = align_to(signature_len, 16);
        // A larger existing reservation is kept and zero-padded so that
        // `LC_CODE_SIGNATURE` and `__LINKEDIT` read as before.
        let datasize = match layout.code_signature {
            Some(cs) if cs.datasize as usize >= needed => cs.datasize as usize,
            _ => needed,
        };
        let end = dataoff + datasize;
        if end > u32::MAX as usize {
            return Err(SignError::Overflow);
        }

        // Finalize the header before hashing it
        write_u32_le(&mut out, cs_offset + 8, dataoff as u32);
        write_u32_le(&mut out, cs_offset + 12, datasize as u32);
        let filesize = end as u64 - linkedit.fileoff;
        let vmsize = linkedit
            .vmsize
            .max(align_to(filesize as usize, LINKEDIT_PAGE_SIZE) as u64);
        write_u64_le(&mut out, linkedit.offset + SEGMENT_FILESIZE_OFFSET, filesize);
        write_u64_le(&mut out, linkedit.offset + SEGMENT_VMSIZE_OFFSET, vmsize);

        let cd_sha1 = cd.build_sha1(&out);
        let cd_sha256 = cd.build_sha256(&out);

        let mut builder = SuperBlobBuilder::new()
            .code_directory_sha1(cd_sha1)
            .requirements(build_requirements_blob())
            .code_directory_sha256(cd_sha256)
            .signature(build_adhoc_signature_blob());
        if let Some(ent) = entitlements {
            builder = builder.entitlements(ent);
        }
        if let Some(der) = der_entitlements {
            builder = builder.der_entitlements(der);
        }
        let signature = builder.build();
        if signature.len() != signature_len {
            return Err(SignError::Malformed(format!(
                "signature is {} bytes, expected {signature_len}",
                signature.len()
            )));
        }

        out.extend(signature);
        out.resize(end, 0);
        Ok(out)
    }
}

/// XML and DER entitlements blobs of the slice's current signature.
fn preserved_entitlements(slice: &[u8], layout: &SliceLayout) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let Some(cs) = layout.code_signature else {
        return (None, None);
    };
    let start = cs.dataoff as usize;
    let Some(signature) = slice.get(start..start.saturating_add(cs.datasize as usize)) else {
        return (None, None);
    };

    let blob_with_magic = |slot: u32, magic: u32| {
        find_blob(signature, slot)
            .filter(|blob| blob.len() >= 8 && blob[..4] == magic.to_be_bytes())
            .map(<[u8]>::to_vec)
    };

    (
        blob_with_magic(CSSLOT_ENTITLEMENTS, CSMAGIC_EMBEDDED_ENTITLEMENTS),
        blob_with_magic(CSSLOT_DER_ENTITLEMENTS, CSMAGIC_EMBEDDED_DER_ENTITLEMENTS),
    )
}
