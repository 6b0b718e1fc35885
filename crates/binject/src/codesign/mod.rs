//! Code signature blobs: CodeDirectory and SuperBlob encoding.

pub mod code_directory;
pub mod constants;
pub mod superblob;

pub use code_directory::CodeDirectoryBuilder;
pub use superblob::SuperBlobBuilder;
