//! Magic numbers, slot indices and flags of the embedded code signature.

// Blob magics
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;
/// XML entitlements, kept verbatim when re-signing.
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;
/// Empty CMS wrapper emitted by ad-hoc signatures.
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;

// SuperBlob slots. The entitlement slots double as CodeDirectory special
// slot numbers (negated).
pub const CSSLOT_CODEDIRECTORY: u32 = 0x0000;
pub const CSSLOT_REQUIREMENTS: u32 = 0x0002;
pub const CSSLOT_ENTITLEMENTS: u32 = 0x0005;
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 0x0007;
/// SHA-256 CodeDirectory; the SHA-1 one stays in slot 0.
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;

pub const CS_HASHTYPE_SHA1: u8 = 1;
pub const CS_HASHTYPE_SHA256: u8 = 2;
pub const CS_SHA1_LEN: usize = 20;
pub const CS_SHA256_LEN: usize = 32;

pub const CS_ADHOC: u32 = 0x0000_0002;
pub const CS_EXECSEG_MAIN_BINARY: u64 = 0x0001;

/// First CodeDirectory version carrying exec-segment fields.
pub const CODEDIRECTORY_VERSION: u32 = 0x20400;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE_LOG2: u8 = 12;
