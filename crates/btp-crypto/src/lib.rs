#![forbid(unsafe_code)]

//! Cryptographic building blocks for BTP.
//!
//! A [`Profile`](identity::Profile) is the signing capability of one user key,
//! and [`DigitalSignature`](signature::DigitalSignature) accumulates a
//! signature over bytes that arrive incrementally.

pub mod identity;
pub mod signature;

pub use identity::{
    public_key_from_hex, user_common_name, user_id_from_common_name, verify_signature, Profile,
    ProfileId, UserId,
};
pub use signature::{DigitalSignature, SignatureError};

pub use ed25519_dalek::VerifyingKey;

#[cfg(test)]
mod proptests;
