//! Profile signing identities.
//!
//! A user may own several profiles, each with its own Ed25519 key. The
//! `(user_id, profile_id)` pair is what travels in BTP headers and what key
//! resolvers are asked about.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand_core::OsRng;
use zeroize::Zeroizing;

use crate::signature::{DigitalSignature, SignatureError};

/// Identity of a user. Zero means "no user".
pub type UserId = u64;

/// Identity of one key (profile) owned by a user. Zero means "no profile".
pub type ProfileId = u64;

const COMMON_NAME_PREFIX: &str = "bitmunk-";

/// A user's profile: the private key a node signs with on that user's behalf.
///
/// Profiles are shared as `Arc<Profile>` between the client, the messenger
/// and the server's response signing; the key itself is never mutated.
#[derive(Clone)]
pub struct Profile {
    user_id: UserId,
    profile_id: ProfileId,
    sign_key: SigningKey,
}

impl Profile {
    /// Generate a new profile with a fresh random key.
    pub fn generate(user_id: UserId, profile_id: ProfileId) -> Self {
        Self {
            user_id,
            profile_id,
            sign_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore a profile from its 32-byte private key seed.
    pub fn from_seed(user_id: UserId, profile_id: ProfileId, seed: &[u8; 32]) -> Self {
        Self {
            user_id,
            profile_id,
            sign_key: SigningKey::from_bytes(seed),
        }
    }

    /// Restore a profile from a hex-encoded seed, as stored in key files.
    pub fn from_seed_hex(
        user_id: UserId,
        profile_id: ProfileId,
        seed_hex: &str,
    ) -> Result<Self, SignatureError> {
        let bytes = Zeroizing::new(
            hex::decode(seed_hex.trim()).map_err(|_| SignatureError::InvalidHex)?,
        );
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidLength {
                expected: 32,
                got: bytes.len(),
            })?;
        Ok(Self::from_seed(user_id, profile_id, &seed))
    }

    /// Hex-encoded private key seed.
    pub fn seed_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.sign_key.to_bytes()))
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn profile_id(&self) -> ProfileId {
        self.profile_id
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.sign_key.verifying_key()
    }

    /// Public key as 64 hex characters, the form served by key services.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key().to_bytes())
    }

    /// Identity name of this profile's user, see [`user_common_name`].
    pub fn common_name(&self) -> String {
        user_common_name(self.user_id)
    }

    /// Start an incremental signature bound to this profile's key.
    pub fn signer(&self) -> DigitalSignature {
        DigitalSignature::for_signing(&self.sign_key)
    }

    /// Sign `message` in one step and return the hex signature.
    pub fn sign(&self, message: &[u8]) -> Result<String, SignatureError> {
        let mut signer = self.signer();
        signer.update(message);
        signer.signature_hex()
    }
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("user_id", &self.user_id)
            .field("profile_id", &self.profile_id)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Verify a hex signature over `message` in one step.
pub fn verify_signature(
    key: &VerifyingKey,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), SignatureError> {
    let mut verifier = DigitalSignature::for_verifying(*key);
    verifier.update(message);
    verifier.verify_hex(signature_hex)
}

/// Parse a 64-hex-character Ed25519 public key.
pub fn public_key_from_hex(key_hex: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = hex::decode(key_hex.trim()).map_err(|_| SignatureError::InvalidHex)?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidLength {
            expected: 32,
            got: bytes.len(),
        })?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| SignatureError::InvalidPublicKey)
}

/// Deterministic identity name for a user.
///
/// Used as the certificate name of a user's virtual host and as the server
/// name a client expects when it connects to that user.
pub fn user_common_name(user_id: UserId) -> String {
    format!("{COMMON_NAME_PREFIX}{user_id}")
}

/// Inverse of [`user_common_name`].
pub fn user_id_from_common_name(name: &str) -> Option<UserId> {
    name.strip_prefix(COMMON_NAME_PREFIX)?
        .parse()
        .ok()
        .filter(|id| *id != 0)
}
