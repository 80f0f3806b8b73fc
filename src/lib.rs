//! Read-only BitLocker (FVE/BDE) volume unlock and sector decryption.
//!
//! Parses the redundant on-disk FVE metadata, derives the volume master key
//! (VMK) from a password or recovery password, unwraps the full volume
//! encryption key (FVEK) under it, and exposes a byte-addressable decrypting
//! read facade over the volume (AES-CBC with the ELEPHANT diffuser, or
//! AES-XTS, with volume-header relocation for v2 volumes). There is no
//! write/encrypt path: this crate only reads already-encrypted volumes.

mod ccm;
mod diffuser;
mod discovery;
mod error;
mod keys;
mod metadata;
mod primitives;
mod sector;
mod unlock;
mod volume;

pub use error::{BdeError, Result};
pub use metadata::{MetadataSet, ProtectionType, Vmk};
pub use primitives::{FileTime, Guid};
pub use sector::{
    ENCRYPTION_METHOD_AES_CBC_128, ENCRYPTION_METHOD_AES_CBC_128_DIFFUSER, ENCRYPTION_METHOD_AES_CBC_256,
    ENCRYPTION_METHOD_AES_CBC_256_DIFFUSER, ENCRYPTION_METHOD_AES_XTS_128, ENCRYPTION_METHOD_AES_XTS_256,
};
pub use unlock::Credential;
pub use volume::{BackingReader, ExclusiveReader, LockedInfo, VolumeHandle};
