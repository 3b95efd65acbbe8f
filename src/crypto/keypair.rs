//! RSA keypair generation and storage for the legacy wire protocol.

use std::path::{Path, PathBuf};

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tracing::info;

use crate::error::{BallotError, CryptoErrorKind};

/// Default RSA modulus size in bits.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// Smallest modulus accepted. Anything below this cannot even hold a
/// PKCS#1 v1.5 padded vote block.
const MIN_KEY_BITS: usize = 512;

/// File name for the public key within the key directory.
pub const PUBLIC_KEY_FILE: &str = "public.pem";

/// File name for the private key within the key directory.
pub const PRIVATE_KEY_FILE: &str = "private.pem";

/// The server's RSA keypair, used only by the legacy (v1) codec.
///
/// Generated once per server instance and persisted as two PEM files in a
/// directory. Read-only after startup and safe to share across sessions.
pub struct KeyPair {
    public: RsaPublicKey,
    private: RsaPrivateKey,
}

impl KeyPair {
    /// Generate a fresh keypair with the given modulus size.
    pub fn generate(bits: usize) -> Result<Self, BallotError> {
        if bits < MIN_KEY_BITS {
            return Err(BallotError::Crypto {
                kind: CryptoErrorKind::InvalidKeySize { bits },
            });
        }

        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits).map_err(|e| BallotError::Crypto {
            kind: CryptoErrorKind::Keygen {
                message: e.to_string(),
            },
        })?;
        let public = RsaPublicKey::from(&private);

        Ok(Self { public, private })
    }

    /// Persist the keypair as `public.pem` and `private.pem` in `dir`.
    ///
    /// The private key file is written with mode 0600 so other users on the
    /// host cannot read it.
    pub fn save(&self, dir: &Path) -> Result<(), BallotError> {
        std::fs::create_dir_all(dir)?;

        let public_path = dir.join(PUBLIC_KEY_FILE);
        let private_path = dir.join(PRIVATE_KEY_FILE);

        self.public
            .write_public_key_pem_file(&public_path, LineEnding::LF)
            .map_err(|e| BallotError::Crypto {
                kind: CryptoErrorKind::Keygen {
                    message: format!("failed to write {}: {}", public_path.display(), e),
                },
            })?;

        self.private
            .write_pkcs8_pem_file(&private_path, LineEnding::LF)
            .map_err(|e| BallotError::Crypto {
                kind: CryptoErrorKind::Keygen {
                    message: format!("failed to write {}: {}", private_path.display(), e),
                },
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&private_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Load a previously saved keypair from `dir`.
    ///
    /// Fails with a `KeyNotFound` error if either PEM file is absent or
    /// unparsable.
    pub fn load(dir: &Path) -> Result<Self, BallotError> {
        let public_path = dir.join(PUBLIC_KEY_FILE);
        let private_path = dir.join(PRIVATE_KEY_FILE);

        let public =
            RsaPublicKey::read_public_key_pem_file(&public_path).map_err(|e| key_not_found(&public_path, e))?;
        let private =
            RsaPrivateKey::read_pkcs8_pem_file(&private_path).map_err(|e| key_not_found(&private_path, e))?;

        Ok(Self { public, private })
    }

    /// Load the keypair from `dir`, generating and persisting a fresh one
    /// if no key material exists yet.
    pub fn load_or_generate(dir: &Path) -> Result<Self, BallotError> {
        match Self::load(dir) {
            Ok(kp) => Ok(kp),
            Err(BallotError::Crypto {
                kind: CryptoErrorKind::KeyNotFound { .. },
            }) => {
                info!(
                    dir = %dir.display(),
                    bits = DEFAULT_KEY_BITS,
                    "No RSA keypair found, generating a new one"
                );
                let kp = Self::generate(DEFAULT_KEY_BITS)?;
                kp.save(dir)?;
                Ok(kp)
            }
            Err(e) => Err(e),
        }
    }

    /// The public half, published to voting sites using the legacy protocol.
    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    /// The private half, used to decrypt inbound v1 blocks.
    pub fn private(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// Size of one v1 ciphertext block in bytes (the modulus byte length).
    pub fn block_size(&self) -> usize {
        self.public.size()
    }
}

fn key_not_found(path: &Path, err: impl std::fmt::Display) -> BallotError {
    BallotError::Crypto {
        kind: CryptoErrorKind::KeyNotFound {
            path: PathBuf::from(path),
            message: err.to_string(),
        },
    }
}
