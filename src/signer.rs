//! Ephemeral ES256 signing key and its public JSON Web Key Set.
//!
//! One keypair is generated per process start and lives only in memory.
//! Anything signed here can be verified by recipients against the key set
//! served at `{path_prefix}/jwks.json`, without a shared secret and
//! without calling back into the identity provider.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation,
    jwk::{
        AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
        EllipticCurveKeyType, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse,
    },
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::info;
use uuid::Uuid;

use crate::{Error, Result};

/// Signing algorithm of every minted token
pub const ALGORITHM: Algorithm = Algorithm::ES256;

/// Length of an uncompressed SEC1 P-256 point: `0x04 || x || y`
const UNCOMPRESSED_P256_LEN: usize = 65;

/// Process-lifetime ES256 signer
pub struct Signer {
    key_id: String,
    encoding_key: EncodingKey,
    public_keys: JwkSet,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Generate a fresh P-256 keypair
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signing`] if key generation fails. Callers treat this
    /// as fatal: the proxy does not start without a key unless token minting
    /// was switched off.
    pub fn generate() -> Result<Self> {
        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| Error::Signing(format!("unable to generate ES256 key: {e}")))?;

        let encoding_key = EncodingKey::from_ec_pem(key_pair.serialize_pem().as_bytes())
            .map_err(|e| Error::Signing(format!("unable to load ES256 key: {e}")))?;

        let key_id = Uuid::new_v4().to_string();
        let public_keys = JwkSet {
            keys: vec![public_jwk(&key_id, key_pair.public_key_raw())?],
        };

        info!(kid = %key_id, "ES256 JSON Web Key generation completed");

        Ok(Self {
            key_id,
            encoding_key,
            public_keys,
        })
    }

    /// Identifier of the signing key, carried as `kid` in every token header
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Sign `claims` into a compact JWS
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signing`] if the claims cannot be serialized or signed.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let mut header = Header::new(ALGORITHM);
        header.kid = Some(self.key_id.clone());
        header.typ = Some("JWT".to_string());

        jsonwebtoken::encode(&header, claims, &self.encoding_key)
            .map_err(|e| Error::Signing(e.to_string()))
    }

    /// The public half of the signing key as a key set
    #[must_use]
    pub fn public_key_set(&self) -> &JwkSet {
        &self.public_keys
    }
}

/// Build the public JWK from an uncompressed P-256 point
fn public_jwk(key_id: &str, point: &[u8]) -> Result<Jwk> {
    if point.len() != UNCOMPRESSED_P256_LEN || point[0] != 0x04 {
        return Err(Error::Signing(format!(
            "unexpected public key encoding ({} bytes)",
            point.len()
        )));
    }

    Ok(Jwk {
        common: CommonParameters {
            public_key_use: Some(PublicKeyUse::Signature),
            key_algorithm: Some(KeyAlgorithm::ES256),
            key_id: Some(key_id.to_string()),
            ..CommonParameters::default()
        },
        algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
            key_type: EllipticCurveKeyType::EC,
            curve: EllipticCurve::P256,
            x: URL_SAFE_NO_PAD.encode(&point[1..33]),
            y: URL_SAFE_NO_PAD.encode(&point[33..65]),
        }),
    })
}

/// Verify a token minted by a [`Signer`] against its public key set
///
/// Checks the signature, `exp`, `nbf` and that `iss` equals `issuer`.
///
/// # Errors
///
/// Returns [`Error::Jwt`] if the token is malformed, signed by an unknown
/// key or fails claim validation.
pub fn verify<T: DeserializeOwned>(token: &str, keys: &JwkSet, issuer: &str) -> Result<TokenData<T>> {
    let header = jsonwebtoken::decode_header(token)?;
    let kid = header.kid.ok_or_else(|| {
        Error::Jwt(jsonwebtoken::errors::ErrorKind::InvalidToken.into())
    })?;
    let jwk = keys.find(&kid).ok_or_else(|| {
        Error::Jwt(jsonwebtoken::errors::ErrorKind::InvalidKeyFormat.into())
    })?;
    let key = DecodingKey::from_jwk(jwk)?;

    let mut validation = Validation::new(ALGORITHM);
    validation.set_issuer(&[issuer]);
    validation.validate_nbf = true;

    Ok(jsonwebtoken::decode::<T>(token, &key, &validation)?)
}
