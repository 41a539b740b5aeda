//! Recipient keys and hybrid encryption of transfer archives
//!
//! Archives are sealed for a single recipient: an ephemeral X25519 key agrees a
//! shared secret with the recipient's public key, HKDF-SHA256 turns it into an
//! AES-256-GCM key, and the archive is encrypted under that key. Only the holder
//! of the matching [`Identity`] can recover the plaintext.
//!
//! Keys travel as text so they fit in config files and JSON requests:
//!
//! ```text
//! recipient: certdist1<base64url(x25519 public key)>
//! identity:  CERTDIST-SECRET-KEY-1<base64url(x25519 private key)>
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use openssl::derive::Deriver;
use openssl::error::ErrorStack;
use openssl::md::Md;
use openssl::pkey::{Id, PKey, Private, Public};
use openssl::pkey_ctx::PkeyCtx;
use openssl::symm::Cipher;
use secrecy::zeroize::Zeroize;
use secrecy::{ExposeSecret, SecretBox};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Prefix of the textual recipient (public key) format
pub const RECIPIENT_PREFIX: &str = "certdist1";
/// Prefix of the textual identity (private key) format
pub const IDENTITY_PREFIX: &str = "CERTDIST-SECRET-KEY-1";

/// Size of a raw X25519 key (public or private)
pub const X25519_KEY_SIZE: usize = 32;
/// Size of AES-256 key (256 bits = 32 bytes)
pub const AES_GCM_256_KEY_SIZE: usize = 32;
/// Size of AES-GCM nonce (96 bits = 12 bytes)
pub const AES_GCM_NONCE_SIZE: usize = 12;
/// Size of AES-GCM authentication tag (128 bits = 16 bytes)
pub const AES_GCM_TAG_SIZE: usize = 16;
/// Size of data length field in serialized format (u32 = 4 bytes)
pub const DATA_LEN_SIZE: usize = 4;

const ENVELOPE_MAGIC: &[u8; 4] = b"CDv1";
const HKDF_INFO: &[u8] = b"certdist archive key v1";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("key operation failed: {0}")]
    OpenSsl(#[from] ErrorStack),
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encrypted data is malformed: {0}")]
    Malformed(&'static str),
    #[error("key agreement failed: {0}")]
    KeyAgreement(#[source] ErrorStack),
    #[error("encryption failed: {0}")]
    Encrypt(#[source] ErrorStack),
    #[error("decryption failed: wrong identity or corrupted data")]
    Decrypt,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Public half of a key pair; archives are encrypted *to* a recipient.
#[derive(Clone, PartialEq, Eq)]
pub struct Recipient {
    raw: [u8; X25519_KEY_SIZE],
}

impl Recipient {
    fn from_raw(raw: &[u8]) -> Result<Self, KeyError> {
        let raw: [u8; X25519_KEY_SIZE] = raw.try_into().map_err(|_| {
            KeyError::InvalidRecipient(format!(
                "expected {} key bytes, got {}",
                X25519_KEY_SIZE,
                raw.len()
            ))
        })?;
        PKey::public_key_from_raw_bytes(&raw, Id::X25519)
            .map_err(|e| KeyError::InvalidRecipient(e.to_string()))?;
        Ok(Self { raw })
    }

    fn public_key(&self) -> Result<PKey<Public>, KeyError> {
        Ok(PKey::public_key_from_raw_bytes(&self.raw, Id::X25519)?)
    }

    /// Seal `plaintext` so that only the matching identity can open it.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ephemeral = PKey::generate_x25519().map_err(CryptoError::KeyAgreement)?;
        let ephemeral_public = ephemeral
            .raw_public_key()
            .map_err(CryptoError::KeyAgreement)?;

        let shared = agree(&ephemeral, &self.public_key()?)?;
        let mut aes_key =
            derive_key(&shared, &ephemeral_public, &self.raw).map_err(CryptoError::KeyAgreement)?;

        let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
        openssl::rand::rand_bytes(&mut nonce).map_err(CryptoError::Encrypt)?;

        let mut envelope = EncryptedEnvelope {
            ephemeral_public,
            nonce: nonce.to_vec(),
            tag: vec![0u8; AES_GCM_TAG_SIZE],
            ciphertext: Vec::new(),
        };
        let aad = envelope.associated_data();
        let result = openssl::symm::encrypt_aead(
            Cipher::aes_256_gcm(),
            &aes_key,
            Some(&nonce),
            &aad,
            plaintext,
            &mut envelope.tag,
        );
        aes_key.zeroize();
        envelope.ciphertext = result.map_err(CryptoError::Encrypt)?;

        Ok(envelope.serialize())
    }
}

impl FromStr for Recipient {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s.trim().strip_prefix(RECIPIENT_PREFIX).ok_or_else(|| {
            KeyError::InvalidRecipient(format!("expected prefix '{}'", RECIPIENT_PREFIX))
        })?;
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| KeyError::InvalidRecipient(e.to_string()))?;
        Self::from_raw(&raw)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", RECIPIENT_PREFIX, URL_SAFE_NO_PAD.encode(self.raw))
    }
}

impl fmt::Debug for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Recipient").field(&self.to_string()).finish()
    }
}

/// Private half of a key pair. Key material is held in a [`SecretBox`] and is
/// zeroized on drop.
pub struct Identity {
    secret: SecretBox<[u8; X25519_KEY_SIZE]>,
}

impl Identity {
    /// Generate a fresh random identity
    pub fn generate() -> Result<Self, KeyError> {
        let key = PKey::generate_x25519()?;
        let mut raw = key.raw_private_key()?;
        let identity = Self::from_raw(&raw);
        raw.zeroize();
        identity
    }

    fn from_raw(raw: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; X25519_KEY_SIZE] = raw.try_into().map_err(|_| {
            KeyError::InvalidIdentity(format!(
                "expected {} key bytes, got {}",
                X25519_KEY_SIZE,
                raw.len()
            ))
        })?;
        let identity = Self {
            secret: SecretBox::new(Box::new(bytes)),
        };
        identity
            .private_key()
            .map_err(|e| KeyError::InvalidIdentity(e.to_string()))?;
        Ok(identity)
    }

    fn private_key(&self) -> Result<PKey<Private>, KeyError> {
        Ok(PKey::private_key_from_raw_bytes(
            self.secret.expose_secret(),
            Id::X25519,
        )?)
    }

    /// The recipient that encrypts to this identity
    pub fn to_recipient(&self) -> Result<Recipient, KeyError> {
        let public = self.private_key()?.raw_public_key()?;
        Recipient::from_raw(&public)
    }

    /// Textual form of the private key. Only meant for writing it out once,
    /// e.g. from the `keygen` command.
    pub fn to_secret_string(&self) -> String {
        format!(
            "{}{}",
            IDENTITY_PREFIX,
            URL_SAFE_NO_PAD.encode(self.secret.expose_secret())
        )
    }

    /// Open an envelope produced by [`Recipient::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let envelope = EncryptedEnvelope::deserialize(data)?;
        let private_key = self.private_key()?;
        let recipient = self.to_recipient()?;

        let ephemeral = PKey::public_key_from_raw_bytes(&envelope.ephemeral_public, Id::X25519)
            .map_err(|_| CryptoError::Malformed("invalid ephemeral key"))?;
        let shared = agree(&private_key, &ephemeral)?;
        let mut aes_key = derive_key(&shared, &envelope.ephemeral_public, &recipient.raw)
            .map_err(CryptoError::KeyAgreement)?;

        let result = openssl::symm::decrypt_aead(
            Cipher::aes_256_gcm(),
            &aes_key,
            Some(&envelope.nonce),
            &envelope.associated_data(),
            &envelope.ciphertext,
            &envelope.tag,
        );
        aes_key.zeroize();
        result.map_err(|_| CryptoError::Decrypt)
    }
}

impl FromStr for Identity {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s.trim().strip_prefix(IDENTITY_PREFIX).ok_or_else(|| {
            KeyError::InvalidIdentity(format!("expected prefix '{}'", IDENTITY_PREFIX))
        })?;
        let mut raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| KeyError::InvalidIdentity(e.to_string()))?;
        let identity = Self::from_raw(&raw);
        raw.zeroize();
        identity
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("secret", &"<redacted>")
            .finish()
    }
}

fn agree(private: &PKey<Private>, peer: &PKey<Public>) -> Result<Vec<u8>, CryptoError> {
    let mut deriver = Deriver::new(private).map_err(CryptoError::KeyAgreement)?;
    deriver.set_peer(peer).map_err(CryptoError::KeyAgreement)?;
    deriver.derive_to_vec().map_err(CryptoError::KeyAgreement)
}

fn derive_key(
    shared: &[u8],
    ephemeral_public: &[u8],
    recipient_public: &[u8],
) -> Result<[u8; AES_GCM_256_KEY_SIZE], ErrorStack> {
    let mut salt = Vec::with_capacity(ephemeral_public.len() + recipient_public.len());
    salt.extend_from_slice(ephemeral_public);
    salt.extend_from_slice(recipient_public);

    let mut ctx = PkeyCtx::new_id(Id::HKDF)?;
    ctx.derive_init()?;
    ctx.set_hkdf_md(Md::sha256())?;
    ctx.set_hkdf_key(shared)?;
    ctx.set_hkdf_salt(&salt)?;
    ctx.add_hkdf_info(HKDF_INFO)?;

    let mut key = [0u8; AES_GCM_256_KEY_SIZE];
    ctx.derive(Some(&mut key))?;
    Ok(key)
}

/// Serialized layout:
/// `magic | ephemeral public key | nonce | tag | ciphertext length (u32 LE) | ciphertext`
struct EncryptedEnvelope {
    ephemeral_public: Vec<u8>,
    nonce: Vec<u8>,
    tag: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    const HEADER_SIZE: usize = ENVELOPE_MAGIC.len() + X25519_KEY_SIZE;

    /// Magic and ephemeral key are authenticated along with the ciphertext.
    fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(Self::HEADER_SIZE);
        aad.extend_from_slice(ENVELOPE_MAGIC);
        aad.extend_from_slice(&self.ephemeral_public);
        aad
    }

    fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(
            Self::HEADER_SIZE
                + AES_GCM_NONCE_SIZE
                + AES_GCM_TAG_SIZE
                + DATA_LEN_SIZE
                + self.ciphertext.len(),
        );
        data.extend_from_slice(&self.associated_data());
        data.extend_from_slice(&self.nonce);
        data.extend_from_slice(&self.tag);
        data.extend_from_slice(&(self.ciphertext.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.ciphertext);
        data
    }

    fn deserialize(data: &[u8]) -> Result<Self, CryptoError> {
        let (magic, rest) = split(data, ENVELOPE_MAGIC.len(), "missing header")?;
        if magic != ENVELOPE_MAGIC {
            return Err(CryptoError::Malformed("unknown format"));
        }
        let (ephemeral_public, rest) = split(rest, X25519_KEY_SIZE, "missing ephemeral key")?;
        let (nonce, rest) = split(rest, AES_GCM_NONCE_SIZE, "missing nonce")?;
        let (tag, rest) = split(rest, AES_GCM_TAG_SIZE, "missing tag")?;
        let (len_bytes, rest) = split(rest, DATA_LEN_SIZE, "missing data length")?;

        let mut len = [0u8; DATA_LEN_SIZE];
        len.copy_from_slice(len_bytes);
        let data_len = u32::from_le_bytes(len) as usize;
        if rest.len() != data_len {
            return Err(CryptoError::Malformed("data length mismatch"));
        }

        Ok(Self {
            ephemeral_public: ephemeral_public.to_vec(),
            nonce: nonce.to_vec(),
            tag: tag.to_vec(),
            ciphertext: rest.to_vec(),
        })
    }
}

fn split<'a>(
    data: &'a [u8],
    at: usize,
    what: &'static str,
) -> Result<(&'a [u8], &'a [u8]), CryptoError> {
    if data.len() < at {
        return Err(CryptoError::Malformed(what));
    }
    Ok(data.split_at(at))
}
