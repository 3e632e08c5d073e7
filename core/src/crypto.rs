use crate::{Error, KdfParams, Result, SnapshotId};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Passphrase or key-file contents. Wiped from memory on drop.
pub struct Secret(Zeroizing<Vec<u8>>);

impl Secret {
    pub fn from_passphrase(passphrase: impl Into<String>) -> Self {
        Self(Zeroizing::new(passphrase.into().into_bytes()))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

pub struct MasterKey {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl MasterKey {
    /// Stretches `secret` with Argon2id under the set's salt.
    pub fn derive(secret: &Secret, kdf: &KdfParams) -> Result<Self> {
        if kdf.algorithm != "argon2id" {
            return Err(Error::Other(format!(
                "unsupported key derivation algorithm {}",
                kdf.algorithm
            )));
        }
        let params = Params::new(kdf.memory, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
            .map_err(|e| Error::Other(format!("invalid key derivation parameters: {}", e)))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(secret.expose(), &kdf.salt, &mut key[..])
            .map_err(|e| Error::Other(format!("key derivation failed: {}", e)))?;
        Ok(Self { key })
    }

    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Self { key }
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != KEY_LEN {
            return None;
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Some(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// Output of [`Encryptor::encrypt`]; the tag is kept apart from the
/// ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
    pub ciphertext: Vec<u8>,
}

impl Sealed {
    /// `nonce | tag | ciphertext`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return None;
        }
        let (nonce, rest) = data.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let mut sealed = Sealed {
            nonce: [0u8; NONCE_LEN],
            tag: [0u8; TAG_LEN],
            ciphertext: ciphertext.to_vec(),
        };
        sealed.nonce.copy_from_slice(nonce);
        sealed.tag.copy_from_slice(tag);
        Some(sealed)
    }
}

pub struct Encryptor {
    cipher: ChaCha20Poly1305,
}

impl Encryptor {
    pub fn new(key: &MasterKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }

    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut buffer)
            .map_err(|e| Error::Other(format!("ChaCha20-Poly1305 encrypt: {}", e)))?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(&tag);
        Ok(Sealed {
            nonce,
            tag: tag_bytes,
            ciphertext: buffer,
        })
    }

    /// Never returns partial plaintext: either the whole message
    /// authenticates or the call fails with [`Error::Auth`].
    pub fn decrypt(&self, sealed: &Sealed, aad: &[u8]) -> Result<Vec<u8>> {
        let mut buffer = sealed.ciphertext.clone();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&sealed.nonce),
                aad,
                &mut buffer,
                Tag::from_slice(&sealed.tag),
            )
            .map_err(|_| Error::Auth {
                context: "sealed data".to_string(),
            })?;
        Ok(buffer)
    }
}

pub const BLOB_MAGIC: &[u8; 4] = b"CRNB";

const BLOB_HEADER_LEN: usize = 5;
const FLAG_COMPRESSED: u8 = 0x01;
const KNOWN_FLAGS: u8 = FLAG_COMPRESSED;

/// Where a blob belongs. Bound into its authentication tag, so a blob moved
/// to another name, slot or backup set does not open.
#[derive(Debug, Clone, Copy)]
pub struct BlobContext<'a> {
    pub set_id: &'a str,
    pub blob_id: &'a str,
    pub snapshot: SnapshotId,
    pub parent: Option<SnapshotId>,
}

impl BlobContext<'_> {
    fn aad(&self, header: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(header.len() + self.set_id.len() + self.blob_id.len() + 32);
        aad.extend_from_slice(header);
        for part in [self.set_id, self.blob_id] {
            aad.extend_from_slice(&(part.len() as u32).to_le_bytes());
            aad.extend_from_slice(part.as_bytes());
        }
        aad.extend_from_slice(&self.snapshot.0.to_le_bytes());
        match self.parent {
            Some(parent) => {
                aad.push(1);
                aad.extend_from_slice(&parent.0.to_le_bytes());
            }
            None => aad.push(0),
        }
        aad
    }

    fn auth_error(&self) -> Error {
        Error::Auth {
            context: format!("blob {} of snapshot {}", self.blob_id, self.snapshot),
        }
    }
}

/// Wraps an archive into the blob envelope:
/// `magic "CRNB" | flags u8 | nonce[12] | tag[16] | ciphertext`.
pub fn seal_blob(
    encryptor: &Encryptor,
    context: &BlobContext<'_>,
    plaintext: &[u8],
    compress: bool,
) -> Result<Vec<u8>> {
    let mut header = [0u8; BLOB_HEADER_LEN];
    header[..4].copy_from_slice(BLOB_MAGIC);

    let compressed;
    let payload = if compress {
        header[4] |= FLAG_COMPRESSED;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(plaintext)?;
        compressed = encoder.finish()?;
        &compressed[..]
    } else {
        plaintext
    };

    let sealed = encryptor.encrypt(payload, &context.aad(&header))?;
    let mut out = Vec::with_capacity(BLOB_HEADER_LEN + NONCE_LEN + TAG_LEN + sealed.ciphertext.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&sealed.to_bytes());
    Ok(out)
}

/// Inverse of [`seal_blob`]. Anything wrong with the envelope or its
/// authentication is an [`Error::Auth`].
pub fn open_blob(encryptor: &Encryptor, context: &BlobContext<'_>, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < BLOB_HEADER_LEN + NONCE_LEN + TAG_LEN || &data[..4] != BLOB_MAGIC {
        return Err(context.auth_error());
    }
    let (header, rest) = data.split_at(BLOB_HEADER_LEN);
    let sealed = Sealed::from_bytes(rest).ok_or_else(|| context.auth_error())?;
    let payload = encryptor
        .decrypt(&sealed, &context.aad(header))
        .map_err(|_| context.auth_error())?;

    let flags = header[4];
    if flags & !KNOWN_FLAGS != 0 {
        return Err(Error::format(
            format!("blob {}", context.blob_id),
            format!("unknown envelope flags {:#04x}", flags),
        ));
    }
    if flags & FLAG_COMPRESSED == 0 {
        return Ok(payload);
    }

    let mut plaintext = Vec::new();
    ZlibDecoder::new(&payload[..])
        .read_to_end(&mut plaintext)
        .map_err(|e| Error::format(format!("blob {}", context.blob_id), e.to_string()))?;
    Ok(plaintext)
}

/// The data key sealed under a key derived from the user's secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub kdf_params: KdfParams,
    #[serde(with = "crate::types::hex_bytes")]
    pub encrypted_key: Vec<u8>,
}

impl KeyFile {
    pub fn wrap(secret: &Secret, kdf_params: KdfParams, data_key: &MasterKey) -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let master = MasterKey::derive(secret, &kdf_params)?;
        let sealed = Encryptor::new(&master).encrypt(data_key.as_bytes(), Self::aad(&id).as_slice())?;
        Ok(Self {
            id,
            created_at: chrono::Utc::now(),
            kdf_params,
            encrypted_key: sealed.to_bytes(),
        })
    }

    /// Recovers the data key. Fails with [`Error::InvalidPassword`] when the
    /// secret does not match.
    pub fn unwrap_key(&self, secret: &Secret) -> Result<MasterKey> {
        let master = MasterKey::derive(secret, &self.kdf_params)?;
        let sealed = Sealed::from_bytes(&self.encrypted_key).ok_or(Error::InvalidPassword)?;
        let key = Zeroizing::new(
            Encryptor::new(&master)
                .decrypt(&sealed, Self::aad(&self.id).as_slice())
                .map_err(|_| Error::InvalidPassword)?,
        );
        MasterKey::from_slice(&key).ok_or(Error::InvalidPassword)
    }

    fn aad(id: &str) -> Vec<u8> {
        let mut aad = b"cairn-key:".to_vec();
        aad.extend_from_slice(id.as_bytes());
        aad
    }
}
