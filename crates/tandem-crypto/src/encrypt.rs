use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use anyhow::{Result, anyhow};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};

use tandem_types::models::{MessageBody, SealedText};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Seals and opens message text with AES-256-GCM.
#[derive(Clone)]
pub struct MessageCipher {
    cipher: Aes256Gcm,
}

impl MessageCipher {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt text under a fresh random nonce. The GCM tag is split off the
    /// ciphertext and stored on its own.
    pub fn seal(&self, plaintext: &str) -> Result<SealedText> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(SealedText {
            ciphertext: B64.encode(&sealed),
            iv: B64.encode(nonce_bytes),
            tag: B64.encode(tag),
        })
    }

    pub fn open(&self, sealed: &SealedText) -> Result<String> {
        let mut combined = B64.decode(&sealed.ciphertext)?;
        let tag = B64.decode(&sealed.tag)?;
        let iv = B64.decode(&sealed.iv)?;
        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(anyhow!("Malformed sealed text"));
        }
        combined.extend_from_slice(&tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), combined.as_ref())
            .map_err(|e| anyhow!("Decryption failed: {}", e))?;

        Ok(String::from_utf8(plaintext)?)
    }

    /// Build the stored body for `text`.
    pub fn seal_body(&self, text: &str) -> Result<MessageBody> {
        Ok(MessageBody::Encrypted(self.seal(text)?))
    }

    /// Readable text of a stored body, whichever form it is in.
    pub fn read_body(&self, body: &MessageBody) -> Result<String> {
        match body {
            MessageBody::Plaintext { text } => Ok(text.clone()),
            MessageBody::Encrypted(sealed) => self.open(sealed),
        }
    }
}
