//! Trailer that carries a body's content signature.
//!
//! A chunked body does not know its final length until the last chunk, so
//! its content signature cannot be put in the head. The sender accumulates
//! the signature while streaming and [`SignedTrailer::finalize`] turns it
//! into a `Btp-Content-Signature` trailer field.

use btp_crypto::DigitalSignature;

use crate::errors::Result;
use crate::http::{names, HeaderFields};

/// Trailer fields for one streamed body, plus the signature feeding them.
#[derive(Debug, Default)]
pub struct SignedTrailer {
    signature: Option<DigitalSignature>,
    fields: HeaderFields,
    content_length: u64,
}

impl SignedTrailer {
    /// A trailer without a signature; it only counts content.
    pub fn new() -> Self {
        Self::default()
    }

    /// A trailer driven by `signature`, which may be in sign or verify mode.
    pub fn with_signature(signature: DigitalSignature) -> Self {
        Self {
            signature: Some(signature),
            ..Self::default()
        }
    }

    pub fn signature(&self) -> Option<&DigitalSignature> {
        self.signature.as_ref()
    }

    /// Account for more logical (uncompressed) body bytes.
    pub fn update(&mut self, data: &[u8]) {
        if let Some(signature) = &mut self.signature {
            signature.update(data);
        }
        self.content_length += data.len() as u64;
    }

    /// Logical body bytes seen so far.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Commit the content signature once the body is complete.
    ///
    /// Only a signing trailer over a non-empty body produces a field.
    pub fn finalize(&mut self) -> Result<()> {
        if self.content_length == 0 {
            return Ok(());
        }
        if let Some(signature) = self.signature.as_ref().filter(|s| s.is_sign_mode()) {
            let value = signature.signature_hex()?;
            self.fields.set(names::BTP_CONTENT_SIGNATURE, value);
        }
        Ok(())
    }

    /// The content signature carried by this trailer, if any.
    pub fn content_signature(&self) -> Option<&str> {
        self.fields.get(names::BTP_CONTENT_SIGNATURE)
    }

    /// Take in trailer fields received after a chunked body.
    pub fn absorb(&mut self, received: &HeaderFields) {
        for (name, value) in received.iter() {
            self.fields.add(name, value);
        }
    }

    pub fn fields(&self) -> &HeaderFields {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut HeaderFields {
        &mut self.fields
    }

    /// Whether the content seen so far matches `signature_hex`.
    ///
    /// Always false for a signing trailer.
    pub fn verify(&self, signature_hex: &str) -> bool {
        self.signature
            .as_ref()
            .is_some_and(|s| s.verify_hex(signature_hex).is_ok())
    }
}
