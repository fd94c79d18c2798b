//! ECDSA key families over the NIST prime curves.
//!
//! Wire fields after the keytype: `string curve ‖ string Q ‖ mpint d`.
//! Signature blobs wrap `mpint r ‖ mpint s` in the usual
//! `string sig-type ‖ blob` envelope. The three curves share all framing
//! logic; only the underlying signing types differ.

use std::collections::HashMap;

use signature::{Signer, Verifier};
use zeroize::Zeroizing;

use super::factory::{CreatePublicKeyFn, KeyTypeHandlers};
use super::{PrivateKey, PublicKey};
use crate::error::{AgentError, AgentResult};
use crate::proto::de::Deserializer;
use crate::proto::error::ProtoResult;
use crate::proto::ser::Serializer;
use crate::secure::SecureBytes;

/// Wire name of the P-256 family.
pub const KEY_TYPE_P256: &str = "ecdsa-sha2-nistp256";
/// Wire name of the P-384 family.
pub const KEY_TYPE_P384: &str = "ecdsa-sha2-nistp384";
/// Wire name of the P-521 family.
pub const KEY_TYPE_P521: &str = "ecdsa-sha2-nistp521";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Curve {
    P256,
    P384,
    P521,
}

impl Curve {
    fn key_type(self) -> &'static str {
        match self {
            Self::P256 => KEY_TYPE_P256,
            Self::P384 => KEY_TYPE_P384,
            Self::P521 => KEY_TYPE_P521,
        }
    }

    fn curve_id(self) -> &'static str {
        match self {
            Self::P256 => "nistp256",
            Self::P384 => "nistp384",
            Self::P521 => "nistp521",
        }
    }

    fn field_len(self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
            Self::P521 => 66,
        }
    }

    fn bits(self) -> usize {
        match self {
            Self::P256 => 256,
            Self::P384 => 384,
            Self::P521 => 521,
        }
    }
}

pub(super) fn register(
    private: &mut HashMap<String, KeyTypeHandlers>,
    public: &mut HashMap<String, CreatePublicKeyFn>,
) {
    private.insert(
        KEY_TYPE_P256.to_string(),
        KeyTypeHandlers {
            create: |blob| create(Curve::P256, blob),
            extract_public: |blob| extract_public(Curve::P256, blob),
            skip,
        },
    );
    private.insert(
        KEY_TYPE_P384.to_string(),
        KeyTypeHandlers {
            create: |blob| create(Curve::P384, blob),
            extract_public: |blob| extract_public(Curve::P384, blob),
            skip,
        },
    );
    private.insert(
        KEY_TYPE_P521.to_string(),
        KeyTypeHandlers {
            create: |blob| create(Curve::P521, blob),
            extract_public: |blob| extract_public(Curve::P521, blob),
            skip,
        },
    );
    public.insert(KEY_TYPE_P256.to_string(), |blob| {
        create_public(Curve::P256, blob)
    });
    public.insert(KEY_TYPE_P384.to_string(), |blob| {
        create_public(Curve::P384, blob)
    });
    public.insert(KEY_TYPE_P521.to_string(), |blob| {
        create_public(Curve::P521, blob)
    });
}

/// Strip leading zero bytes, as mpint magnitudes carry none.
fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Left-pad a scalar to the curve's fixed field width.
fn left_pad(bytes: &[u8], width: usize) -> AgentResult<Zeroizing<Vec<u8>>> {
    if bytes.len() > width {
        return Err(AgentError::crypto("ecdsa: scalar wider than the field"));
    }
    let mut out = Zeroizing::new(vec![0u8; width]);
    out[width - bytes.len()..].copy_from_slice(bytes);
    Ok(out)
}

enum EcdsaSigner {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    P521(p521::ecdsa::SigningKey),
}

impl EcdsaSigner {
    fn new(curve: Curve, scalar: &SecureBytes) -> AgentResult<Self> {
        let padded = left_pad(scalar, curve.field_len())?;
        let invalid = |_| AgentError::crypto("ecdsa: invalid private scalar");
        Ok(match curve {
            Curve::P256 => Self::P256(p256::ecdsa::SigningKey::from_slice(&padded).map_err(invalid)?),
            Curve::P384 => Self::P384(p384::ecdsa::SigningKey::from_slice(&padded).map_err(invalid)?),
            Curve::P521 => Self::P521(p521::ecdsa::SigningKey::from_slice(&padded).map_err(invalid)?),
        })
    }

    /// Sign and return the raw `(r, s)` scalars, fixed field width.
    fn sign_scalars(&self, data: &[u8]) -> AgentResult<(Vec<u8>, Vec<u8>)> {
        let failed = |_| AgentError::crypto("ecdsa: signing failed");
        Ok(match self {
            Self::P256(key) => {
                let sig: p256::ecdsa::Signature = key.try_sign(data).map_err(failed)?;
                let (r, s) = sig.split_bytes();
                (r.to_vec(), s.to_vec())
            }
            Self::P384(key) => {
                let sig: p384::ecdsa::Signature = key.try_sign(data).map_err(failed)?;
                let (r, s) = sig.split_bytes();
                (r.to_vec(), s.to_vec())
            }
            Self::P521(key) => {
                let sig: p521::ecdsa::Signature = key.try_sign(data).map_err(failed)?;
                let (r, s) = sig.split_bytes();
                (r.to_vec(), s.to_vec())
            }
        })
    }

    /// The private scalar, big-endian at field width.
    fn scalar_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(match self {
            Self::P256(key) => key.to_bytes().to_vec(),
            Self::P384(key) => key.to_bytes().to_vec(),
            Self::P521(key) => key.to_bytes().to_vec(),
        })
    }
}

enum EcdsaVerifier {
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    P521(p521::ecdsa::VerifyingKey),
}

impl EcdsaVerifier {
    fn new(curve: Curve, point: &[u8]) -> AgentResult<Self> {
        let invalid = |_| AgentError::crypto("ecdsa: invalid public point");
        Ok(match curve {
            Curve::P256 => {
                Self::P256(p256::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(invalid)?)
            }
            Curve::P384 => {
                Self::P384(p384::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(invalid)?)
            }
            Curve::P521 => {
                Self::P521(p521::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(invalid)?)
            }
        })
    }

    fn verify_scalars(&self, data: &[u8], r: &[u8], s: &[u8]) -> AgentResult<()> {
        let malformed = |_| AgentError::crypto("ecdsa: malformed signature scalars");
        let rejected = |_| AgentError::crypto("ecdsa: signature verification failed");
        match self {
            Self::P256(key) => {
                let sig = p256::ecdsa::Signature::from_scalars(
                    *p256::FieldBytes::from_slice(r),
                    *p256::FieldBytes::from_slice(s),
                )
                .map_err(malformed)?;
                key.verify(data, &sig).map_err(rejected)
            }
            Self::P384(key) => {
                let sig = p384::ecdsa::Signature::from_scalars(
                    *p384::FieldBytes::from_slice(r),
                    *p384::FieldBytes::from_slice(s),
                )
                .map_err(malformed)?;
                key.verify(data, &sig).map_err(rejected)
            }
            Self::P521(key) => {
                let sig = p521::ecdsa::Signature::from_scalars(
                    *p521::FieldBytes::from_slice(r),
                    *p521::FieldBytes::from_slice(s),
                )
                .map_err(malformed)?;
                key.verify(data, &sig).map_err(rejected)
            }
        }
    }
}

fn public_blob_from(curve: Curve, point: &[u8]) -> AgentResult<Vec<u8>> {
    let mut s = Serializer::new();
    s.write_string(curve.key_type())?;
    s.write_string(curve.curve_id())?;
    s.write_blob(point)?;
    Ok(s.into_vec())
}

fn read_curve_and_point(
    curve: Curve,
    d: &mut Deserializer<'_>,
) -> AgentResult<Vec<u8>> {
    let curve_id = d.read_string()?;
    if curve_id != curve.curve_id() {
        return Err(AgentError::crypto(format!(
            "ecdsa: curve {curve_id} does not match key type {}",
            curve.key_type()
        )));
    }
    Ok(d.read_blob()?)
}

fn create(curve: Curve, blob: &SecureBytes) -> AgentResult<Box<dyn PrivateKey>> {
    let mut d = Deserializer::new(blob);
    let point = read_curve_and_point(curve, &mut d)?;
    let scalar = d.read_mpint_secure()?;

    // Parse the point so a corrupt key is refused at add time.
    EcdsaVerifier::new(curve, &point)?;
    let signer = EcdsaSigner::new(curve, &scalar)?;

    let public_blob = public_blob_from(curve, &point)?;
    Ok(Box::new(EcdsaKey {
        curve,
        signer,
        point,
        public_blob,
    }))
}

fn extract_public(curve: Curve, blob: &SecureBytes) -> AgentResult<Vec<u8>> {
    let mut d = Deserializer::new(blob);
    let point = read_curve_and_point(curve, &mut d)?;
    public_blob_from(curve, &point)
}

fn skip(d: &mut Deserializer<'_>) -> ProtoResult<()> {
    d.discard_blob()?; // curve id
    d.discard_blob()?; // point
    d.discard_blob() // private scalar
}

fn create_public(curve: Curve, blob: &[u8]) -> AgentResult<Box<dyn PublicKey>> {
    let mut d = Deserializer::new(blob);
    let key_type = d.read_string()?;
    if key_type != curve.key_type() {
        return Err(AgentError::crypto("ecdsa: wrong key type in blob"));
    }
    let point = read_curve_and_point(curve, &mut d)?;
    let verifier = EcdsaVerifier::new(curve, &point)?;
    Ok(Box::new(EcdsaPub {
        curve,
        blob: blob.to_vec(),
        verifier,
    }))
}

struct EcdsaKey {
    curve: Curve,
    signer: EcdsaSigner,
    point: Vec<u8>,
    public_blob: Vec<u8>,
}

impl std::fmt::Debug for EcdsaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EcdsaKey({})", self.curve.key_type())
    }
}

impl PrivateKey for EcdsaKey {
    fn key_type(&self) -> &'static str {
        self.curve.key_type()
    }

    fn public_blob(&self) -> &[u8] {
        &self.public_blob
    }

    fn sign(&self, data: &[u8], _flags: u32) -> AgentResult<Vec<u8>> {
        let (r, s) = self.signer.sign_scalars(data)?;

        let mut inner = Serializer::new();
        inner.write_mpint(trim_leading_zeros(&r))?;
        inner.write_mpint(trim_leading_zeros(&s))?;

        let mut out = Serializer::new();
        out.write_string(self.curve.key_type())?;
        out.write_blob(inner.as_bytes())?;
        Ok(out.into_vec())
    }

    fn encode_private(&self) -> AgentResult<SecureBytes> {
        let scalar = self.signer.scalar_bytes();
        let mut s = Serializer::new();
        s.write_string(self.curve.curve_id())?;
        s.write_blob(&self.point)?;
        s.write_mpint(trim_leading_zeros(&scalar))?;
        Ok(s.into_secure())
    }
}

struct EcdsaPub {
    curve: Curve,
    blob: Vec<u8>,
    verifier: EcdsaVerifier,
}

impl std::fmt::Debug for EcdsaPub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EcdsaPub({})", self.curve.key_type())
    }
}

impl PublicKey for EcdsaPub {
    fn key_type(&self) -> &'static str {
        self.curve.key_type()
    }

    fn blob(&self) -> &[u8] {
        &self.blob
    }

    fn bits(&self) -> usize {
        self.curve.bits()
    }

    fn family(&self) -> &'static str {
        "ECDSA"
    }

    fn verify(&self, data: &[u8], signature_blob: &[u8]) -> AgentResult<()> {
        let mut d = Deserializer::new(signature_blob);
        let sig_type = d.read_string()?;
        if sig_type != self.curve.key_type() {
            return Err(AgentError::crypto(format!(
                "ecdsa: unexpected signature type {sig_type}"
            )));
        }
        let inner = d.read_blob()?;
        let mut d = Deserializer::new(&inner);
        let r = d.read_mpint()?;
        let s = d.read_mpint()?;
        let width = self.curve.field_len();
        let r = left_pad(&r, width)?;
        let s = left_pad(&s, width)?;
        self.verifier.verify_scalars(data, &r, &s)
    }
}
