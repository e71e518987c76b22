//! Payload confidentiality helper.
//!
//! AES-256-CBC with a fresh random IV per call. Each encrypted value is
//! self-describing: `hex(iv):hex(ciphertext)`, so values can be decrypted
//! independently of one another.

use crate::error::{CryptoConfigError, CryptoError};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;
use zeroize::Zeroize;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const DELIMITER: char = ':';

/// Symmetric cipher protecting code and results in transit to the sandbox.
/// The key is zeroized when the cipher is dropped.
pub struct PayloadCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher").finish_non_exhaustive()
    }
}

impl Drop for PayloadCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl PayloadCipher {
    /// Build a cipher from raw key bytes. Anything other than exactly
    /// 32 bytes fails before any cipher operation is attempted.
    pub fn new(key: &[u8]) -> Result<Self, CryptoConfigError> {
        if key.len() != KEY_LEN {
            return Err(CryptoConfigError::KeyLength(key.len()));
        }
        let mut fixed = [0u8; KEY_LEN];
        fixed.copy_from_slice(key);
        Ok(Self { key: fixed })
    }

    /// Build a cipher from a hex-encoded key string (config file form).
    pub fn from_hex(key_hex: &str) -> Result<Self, CryptoConfigError> {
        let mut key = hex::decode(key_hex.trim())
            .map_err(|e| CryptoConfigError::KeyEncoding(e.to_string()))?;
        let cipher = Self::new(&key);
        key.zeroize();
        cipher
    }

    /// Encrypt an opaque byte payload. Output format: `hex(iv):hex(ct)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new((&self.key).into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        format!("{}{DELIMITER}{}", hex::encode(iv), hex::encode(ciphertext))
    }

    /// Decrypt a value produced by [`encrypt`](Self::encrypt). Fails on a
    /// missing delimiter or malformed fields; never returns partial output.
    pub fn decrypt(&self, token: &str) -> Result<Vec<u8>, CryptoError> {
        let (iv_hex, ct_hex) = token
            .split_once(DELIMITER)
            .ok_or(CryptoError::MissingDelimiter)?;

        let iv = hex::decode(iv_hex)
            .map_err(|e| CryptoError::Malformed(format!("invalid IV hex: {e}")))?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::Malformed(format!(
                "IV must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }

        let ciphertext = hex::decode(ct_hex)
            .map_err(|e| CryptoError::Malformed(format!("invalid ciphertext hex: {e}")))?;

        let iv_arr: [u8; IV_LEN] = iv.try_into().map_err(|_| {
            CryptoError::Malformed("IV conversion failed".to_string())
        })?;

        Aes256CbcDec::new((&self.key).into(), (&iv_arr).into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| CryptoError::Malformed("bad padding or truncated ciphertext".to_string()))
    }

    /// String convenience wrapper around [`decrypt`](Self::decrypt).
    pub fn decrypt_str(&self, token: &str) -> Result<String, CryptoError> {
        let plaintext = self.decrypt(token)?;
        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::Malformed(format!("decrypted value is not UTF-8: {e}")))
    }
}
