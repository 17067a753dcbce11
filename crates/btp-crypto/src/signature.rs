//! Incremental Ed25519ph signatures.
//!
//! BTP signs message bodies while they are streamed, so the whole body is
//! never available at once. Signatures are therefore computed in prehashed
//! mode: bytes are folded into a SHA-512 state and the digest is signed (or
//! verified) once the stream ends.

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};

/// Domain separation context mixed into every BTP signature.
const SIGNATURE_CONTEXT: &[u8] = b"bitmunk-btp";

/// Error type for signature operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature object is in verify mode and cannot sign")]
    NotSigning,
    #[error("signature object is in sign mode and cannot verify")]
    NotVerifying,
    #[error("invalid signature length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid hex encoding")]
    InvalidHex,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signature does not match")]
    Mismatch,
    #[error("signing failed")]
    SigningFailed,
}

enum Mode {
    Sign(SigningKey),
    Verify(VerifyingKey),
}

/// A signature that is accumulated over a stream of bytes.
///
/// Created in sign mode from a private key or in verify mode from a public
/// key. Both modes hash exactly the same way, so a verifier fed the same
/// bytes as a signer accepts the signer's output.
pub struct DigitalSignature {
    mode: Mode,
    digest: Sha512,
    processed: u64,
}

impl DigitalSignature {
    /// Start a signature that will be produced with `key`.
    pub fn for_signing(key: &SigningKey) -> Self {
        Self {
            mode: Mode::Sign(key.clone()),
            digest: Sha512::new(),
            processed: 0,
        }
    }

    /// Start a signature that will be checked against `key`.
    pub fn for_verifying(key: VerifyingKey) -> Self {
        Self {
            mode: Mode::Verify(key),
            digest: Sha512::new(),
            processed: 0,
        }
    }

    pub fn is_sign_mode(&self) -> bool {
        matches!(self.mode, Mode::Sign(_))
    }

    /// Fold more bytes into the signature.
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.processed += data.len() as u64;
    }

    /// Number of bytes folded in so far.
    pub fn bytes_processed(&self) -> u64 {
        self.processed
    }

    /// Produce the signature over everything seen so far.
    ///
    /// The internal state is not consumed, so more data may still be added.
    pub fn signature(&self) -> Result<Signature, SignatureError> {
        match &self.mode {
            Mode::Sign(key) => key
                .sign_prehashed(self.digest.clone(), Some(SIGNATURE_CONTEXT))
                .map_err(|_| SignatureError::SigningFailed),
            Mode::Verify(_) => Err(SignatureError::NotSigning),
        }
    }

    /// Produce the signature as lowercase hex, the form it takes on the wire.
    pub fn signature_hex(&self) -> Result<String, SignatureError> {
        Ok(hex::encode(self.signature()?.to_bytes()))
    }

    /// Check `signature` against everything seen so far.
    pub fn verify(&self, signature: &[u8]) -> Result<(), SignatureError> {
        let key = match &self.mode {
            Mode::Verify(key) => key,
            Mode::Sign(_) => return Err(SignatureError::NotVerifying),
        };
        let bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureError::InvalidLength {
                expected: 64,
                got: signature.len(),
            })?;
        let sig = Signature::from_bytes(&bytes);
        key.verify_prehashed(self.digest.clone(), Some(SIGNATURE_CONTEXT), &sig)
            .map_err(|_| SignatureError::Mismatch)
    }

    /// Check a hex-encoded signature as received on the wire.
    pub fn verify_hex(&self, signature: &str) -> Result<(), SignatureError> {
        let bytes = hex::decode(signature.trim()).map_err(|_| SignatureError::InvalidHex)?;
        self.verify(&bytes)
    }
}

impl std::fmt::Debug for DigitalSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalSignature")
            .field("sign_mode", &self.is_sign_mode())
            .field("processed", &self.processed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_incremental_matches_one_shot() {
        let key = SigningKey::generate(&mut OsRng);

        let mut chunked = DigitalSignature::for_signing(&key);
        chunked.update(b"hello ");
        chunked.update(b"world");

        let mut whole = DigitalSignature::for_signing(&key);
        whole.update(b"hello world");

        assert_eq!(chunked.signature_hex().unwrap(), whole.signature_hex().unwrap());
        assert_eq!(chunked.bytes_processed(), 11);
    }

    #[test]
    fn test_verify_round_trip() {
        let key = SigningKey::generate(&mut OsRng);
        let mut signer = DigitalSignature::for_signing(&key);
        signer.update(b"payload");
        let sig = signer.signature_hex().unwrap();

        let mut verifier = DigitalSignature::for_verifying(key.verifying_key());
        verifier.update(b"pay");
        verifier.update(b"load");
        assert!(verifier.verify_hex(&sig).is_ok());
    }

    #[test]
    fn test_verify_rejects_other_bytes() {
        let key = SigningKey::generate(&mut OsRng);
        let mut signer = DigitalSignature::for_signing(&key);
        signer.update(b"payload");
        let sig = signer.signature_hex().unwrap();

        let mut verifier = DigitalSignature::for_verifying(key.verifying_key());
        verifier.update(b"payloaD");
        assert_eq!(verifier.verify_hex(&sig), Err(SignatureError::Mismatch));
    }

    #[test]
    fn test_mode_mismatch() {
        let key = SigningKey::generate(&mut OsRng);
        let signer = DigitalSignature::for_signing(&key);
        assert_eq!(signer.verify(&[0u8; 64]), Err(SignatureError::NotVerifying));

        let verifier = DigitalSignature::for_verifying(key.verifying_key());
        assert!(matches!(verifier.signature(), Err(SignatureError::NotSigning)));
    }

    #[test]
    fn test_bad_encodings() {
        let key = SigningKey::generate(&mut OsRng);
        let verifier = DigitalSignature::for_verifying(key.verifying_key());
        assert_eq!(verifier.verify_hex("zz"), Err(SignatureError::InvalidHex));
        assert_eq!(
            verifier.verify(&[1, 2, 3]),
            Err(SignatureError::InvalidLength { expected: 64, got: 3 })
        );
    }
}
