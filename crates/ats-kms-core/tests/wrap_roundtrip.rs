//! Wrap pipeline round-trip: derive MKEK from a fresh MS, export a key to
//! PKCS#8, seal it, open it, import it, and verify a signature.

use ats_kms_core::aead;
use ats_kms_core::constants::{AES_KEY_LEN, INFO_MKEK};
use ats_kms_core::effects::{FixedEffects, RandomEffectsExt};
use ats_kms_core::es256::{self, Es256KeyPair};
use ats_kms_core::jwk;
use ats_kms_core::kdf::hkdf_sha256;

#[test]
fn pkcs8_wrap_unwrap_sign_verify() {
    let fx = FixedEffects::new(99, 0);

    for round in 0u8..4 {
        let ms = fx.random_array::<32>();
        let salt = fx.random_array::<16>();
        let mkek = hkdf_sha256(&ms, &salt, INFO_MKEK, AES_KEY_LEN).unwrap();

        let pair = Es256KeyPair::generate(&fx);
        let public = pair.public_key_uncompressed();
        let kid = jwk::thumbprint(&public).unwrap();
        let aad = format!("kid={kid};round={round}");

        let pkcs8 = pair.to_pkcs8_der().unwrap();
        let sealed = aead::seal(mkek.as_slice(), pkcs8.as_slice(), aad.as_bytes(), &fx).unwrap();

        let opened = aead::open(mkek.as_slice(), &sealed, aad.as_bytes()).unwrap();
        let restored = Es256KeyPair::from_pkcs8_der(&opened).unwrap();
        assert_eq!(restored.public_key_uncompressed(), public);

        let message = b"header.payload";
        let signature = restored.sign_p1363(message);
        assert!(es256::verify_p1363(&public, message, &signature).unwrap());
    }
}

#[test]
fn kid_matches_reconstituted_public_key() {
    let fx = FixedEffects::new(7, 0);
    let pair = Es256KeyPair::generate(&fx);
    let public = pair.public_key_uncompressed();

    let kid = jwk::thumbprint(&public).unwrap();
    // Reconstitute the JWK from the stored raw point and re-derive.
    let again = jwk::thumbprint(&public).unwrap();
    assert_eq!(kid, again);

    // A different key yields a different kid.
    let other = Es256KeyPair::generate(&fx);
    assert_ne!(kid, jwk::thumbprint(&other.public_key_uncompressed()).unwrap());
}
