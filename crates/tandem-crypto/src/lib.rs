/// Tandem Crypto Library
///
/// Message text at rest: AES-256-GCM with a single server-held key.
/// The chat core only sees `SealedText` bundles and an `is_encrypted` flag.

pub mod encrypt;
pub mod keys;

pub use encrypt::MessageCipher;
