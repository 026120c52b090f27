//! Originator identity of an assembly: a full public key or its 8 byte token.
//!
//! An assembly declares its originator with `.publickey`; references may use either
//! `.publickey` or `.publickeytoken`. References are always emitted with the token form,
//! computed as the last 8 bytes of the key's hash in reverse order.
//!
//! # Example
//! ```rust
//! use dotasm::manifest::Originator;
//! use dotasm::metadata::flags::AssemblyHashAlgorithm;
//!
//! let key = Originator::PublicKey(vec![0x00, 0x24, 0x00, 0x00, 0x04, 0x80]);
//! let token = key.to_token(AssemblyHashAlgorithm::SHA1)?;
//! assert_eq!(token.len(), 8);
//! # Ok::<(), dotasm::Error>(())
//! ```

use md5::{Digest, Md5};
use sha1::Sha1;

use crate::{metadata::flags::AssemblyHashAlgorithm, utils::read_le, Result};

/// Size of a public key token
pub const TOKEN_SIZE: usize = 8;

/// The originator of an assembly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Originator {
    /// Full public key (`.publickey`)
    PublicKey(Vec<u8>),
    /// Public key token (`.publickeytoken`), as stored in the blob
    Token(Vec<u8>),
}

impl Originator {
    /// Returns the blob stored in the `PublicKeyOrToken` column.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Originator::PublicKey(data) | Originator::Token(data) => data,
        }
    }

    /// Returns true for a full public key
    #[must_use]
    pub fn is_public_key(&self) -> bool {
        matches!(self, Originator::PublicKey(_))
    }

    /// The public key token of this originator.
    ///
    /// A token is returned unchanged. A public key is hashed with `algo` (SHA1 unless MD5
    /// is requested); the token is the last 8 bytes of the hash, read as a little-endian
    /// `u64` and stored big-endian.
    ///
    /// # Errors
    /// Returns an error if a declared token does not have 8 bytes.
    pub fn to_token(&self, algo: u32) -> Result<Vec<u8>> {
        match self {
            Originator::Token(token) => {
                if token.len() != TOKEN_SIZE {
                    return Err(malformed_error!(
                        "Public key token must have {} bytes, found {}",
                        TOKEN_SIZE,
                        token.len()
                    ));
                }
                Ok(token.clone())
            }
            Originator::PublicKey(key) => {
                let hash = compute_hash(key, algo);
                let value = read_le::<u64>(&hash[hash.len() - TOKEN_SIZE..])?;
                Ok(value.to_be_bytes().to_vec())
            }
        }
    }
}

/// Hashes `data` with the assembly hash algorithm `algo`.
///
/// MD5 for [`AssemblyHashAlgorithm::MD5`], SHA1 for everything else.
#[must_use]
pub fn compute_hash(data: &[u8], algo: u32) -> Vec<u8> {
    if algo == AssemblyHashAlgorithm::MD5 {
        let mut hasher = Md5::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    } else {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_from_public_key() {
        let ecma = Originator::PublicKey(vec![0; 16]);
        let token = ecma.to_token(AssemblyHashAlgorithm::SHA1).unwrap();
        assert_eq!(token.len(), 8);

        let sha1 = compute_hash(&[0; 16], AssemblyHashAlgorithm::SHA1);
        let mut expected = sha1[sha1.len() - 8..].to_vec();
        expected.reverse();
        assert_eq!(token, expected);
    }

    #[test]
    fn token_algorithms_differ() {
        let key = Originator::PublicKey(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let sha1 = key.to_token(AssemblyHashAlgorithm::SHA1).unwrap();
        let md5 = key.to_token(AssemblyHashAlgorithm::MD5).unwrap();
        assert_ne!(sha1, md5);
    }

    #[test]
    fn token_passthrough() {
        let token = Originator::Token(vec![0xB7, 0x7A, 0x5C, 0x56, 0x19, 0x34, 0xE0, 0x89]);
        assert_eq!(
            token.to_token(AssemblyHashAlgorithm::SHA1).unwrap(),
            vec![0xB7, 0x7A, 0x5C, 0x56, 0x19, 0x34, 0xE0, 0x89]
        );
        assert!(Originator::Token(vec![1, 2]).to_token(0).is_err());
    }
}
