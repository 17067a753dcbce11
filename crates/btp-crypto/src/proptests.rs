#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::identity::{verify_signature, Profile};
    use crate::signature::DigitalSignature;

    proptest! {
        #[test]
        fn test_sign_verify_round_trip(
            seed in any::<[u8; 32]>(),
            payload in any::<Vec<u8>>()
        ) {
            let profile = Profile::from_seed(1, 1, &seed);
            let sig = profile.sign(&payload).unwrap();
            prop_assert!(verify_signature(&profile.public_key(), &payload, &sig).is_ok());
        }

        #[test]
        fn test_single_bit_flip_fails(
            seed in any::<[u8; 32]>(),
            line in "[A-Z]{3,7} /[a-z0-9/]{0,24} HTTP/1\\.1",
            host in "[a-z]{1,12}\\.example:[0-9]{2,5}",
            bit in any::<prop::sample::Index>()
        ) {
            let profile = Profile::from_seed(1, 1, &seed);
            let mut signed = line.into_bytes();
            signed.extend_from_slice(host.as_bytes());
            let sig = profile.sign(&signed).unwrap();

            let index = bit.index(signed.len() * 8);
            signed[index / 8] ^= 1 << (index % 8);
            prop_assert!(verify_signature(&profile.public_key(), &signed, &sig).is_err());
        }

        #[test]
        fn test_chunking_does_not_change_signature(
            seed in any::<[u8; 32]>(),
            payload in prop::collection::vec(any::<u8>(), 1..2048),
            split in any::<prop::sample::Index>()
        ) {
            let profile = Profile::from_seed(9, 2, &seed);
            let at = split.index(payload.len());

            let mut chunked = profile.signer();
            chunked.update(&payload[..at]);
            chunked.update(&payload[at..]);

            let mut verifier = DigitalSignature::for_verifying(profile.public_key());
            verifier.update(&payload);
            prop_assert!(verifier.verify_hex(&chunked.signature_hex().unwrap()).is_ok());
        }
    }
}
