//! BLS12-381 signatures and threshold-key primitives
//!
//! Public keys and verification vectors live in G1 (48-byte compressed),
//! signatures in G2 (96-byte compressed). Messages are hashed to G2 with the
//! standard proof-of-possession DST. Shamir sharing operates over the scalar
//! field; verification vectors are Feldman commitments to the polynomial
//! coefficients, so shares can be checked without revealing the secret.

use crate::{Error, Result};
use bls12_381::hash_to_curve::{ExpandMsgXmd, HashToCurve};
use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::{Curve, Group};
use rand::rngs::OsRng;
use std::fmt;

const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Hash a signing root into G2
pub fn hash_to_point(message: &[u8]) -> G2Projective {
    <G2Projective as HashToCurve<ExpandMsgXmd<sha2_0_9::Sha256>>>::hash_to_curve(message, DST)
}

/// BLS secret scalar
#[derive(Clone)]
pub struct SecretKey(Scalar);

impl SecretKey {
    /// Generate a fresh random key
    pub fn random() -> Self {
        Self(Scalar::random(&mut OsRng))
    }

    pub fn from_scalar(scalar: Scalar) -> Self {
        Self(scalar)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("secret key must be 32 bytes".into()))?;
        Option::<Scalar>::from(Scalar::from_bytes(&array))
            .map(Self)
            .ok_or_else(|| Error::Crypto("non-canonical secret key encoding".into()))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn as_scalar(&self) -> &Scalar {
        &self.0
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(G1Projective::generator() * self.0)
    }

    /// Sign a message (a 32-byte signing root in practice)
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(hash_to_point(message) * self.0)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecretKey").field(&"[REDACTED]").finish()
    }
}

/// BLS public key in G1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(G1Projective);

impl PublicKey {
    pub fn from_point(point: G1Projective) -> Self {
        Self(point)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 48] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("public key must be 48 bytes".into()))?;
        Option::<G1Affine>::from(G1Affine::from_compressed(&array))
            .map(|affine| Self(G1Projective::from(affine)))
            .ok_or_else(|| Error::Crypto("invalid public key encoding".into()))
    }

    pub fn to_bytes(&self) -> [u8; 48] {
        self.0.to_affine().to_compressed()
    }

    pub fn as_point(&self) -> &G1Projective {
        &self.0
    }

    /// Verify a signature over a message under this key
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let hashed = hash_to_point(message).to_affine();
        pairing(&self.0.to_affine(), &hashed)
            == pairing(&G1Affine::generator(), &signature.0.to_affine())
    }
}

/// BLS signature in G2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(G2Projective);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 96] = bytes
            .try_into()
            .map_err(|_| Error::Crypto("signature must be 96 bytes".into()))?;
        Option::<G2Affine>::from(G2Affine::from_compressed(&array))
            .map(|affine| Self(G2Projective::from(affine)))
            .ok_or_else(|| Error::Crypto("invalid signature encoding".into()))
    }

    pub fn to_bytes(&self) -> [u8; 96] {
        self.0.to_affine().to_compressed()
    }
}

/// Random polynomial over the scalar field, degree `threshold - 1`
///
/// The constant term is the contributed secret; Feldman commitments to the
/// coefficients form this participant's verification vector.
pub struct Polynomial {
    coefficients: Vec<Scalar>,
}

impl Polynomial {
    /// Generate a random polynomial with `threshold` coefficients
    pub fn random(threshold: usize) -> Result<Self> {
        if threshold == 0 {
            return Err(Error::Invalid("threshold must be at least 1".into()));
        }
        let coefficients = (0..threshold)
            .map(|_| Scalar::random(&mut OsRng))
            .collect();
        Ok(Self { coefficients })
    }

    /// Evaluate at a participant id using Horner's method
    pub fn evaluate(&self, id: u64) -> Scalar {
        let x = Scalar::from(id);
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
    }

    /// The share destined for a participant, as key material
    pub fn secret_share(&self, id: u64) -> SecretKey {
        SecretKey::from_scalar(self.evaluate(id))
    }

    /// Feldman commitments to the coefficients
    pub fn commitments(&self) -> Vec<PublicKey> {
        self.coefficients
            .iter()
            .map(|coefficient| PublicKey(G1Projective::generator() * coefficient))
            .collect()
    }
}

/// Evaluate a verification vector at a participant id: `Σ V[m]·id^m`
///
/// The result is the public key of that participant's share.
pub fn evaluate_verification_vector(vector: &[PublicKey], id: u64) -> PublicKey {
    let x = Scalar::from(id);
    let mut accumulator = G1Projective::identity();
    let mut power = Scalar::ONE;
    for commitment in vector {
        accumulator += commitment.0 * power;
        power *= x;
    }
    PublicKey(accumulator)
}

/// Check a received share against the sender's verification vector
pub fn verify_share(share: &Scalar, vector: &[PublicKey], id: u64) -> bool {
    G1Projective::generator() * share == evaluate_verification_vector(vector, id).0
}

/// Sum per-participant share contributions into the final share
pub fn combine_shares<'a>(shares: impl IntoIterator<Item = &'a SecretKey>) -> SecretKey {
    let sum = shares
        .into_iter()
        .fold(Scalar::ZERO, |acc, share| acc + share.as_scalar());
    SecretKey::from_scalar(sum)
}

/// Pointwise sum of participant verification vectors
pub fn aggregate_verification_vectors(vectors: &[Vec<PublicKey>]) -> Result<Vec<PublicKey>> {
    let length = match vectors.first() {
        Some(first) => first.len(),
        None => return Err(Error::Invalid("no verification vectors".into())),
    };
    if vectors.iter().any(|v| v.len() != length) {
        return Err(Error::Crypto("verification vector length mismatch".into()));
    }
    Ok((0..length)
        .map(|i| {
            PublicKey(
                vectors
                    .iter()
                    .fold(G1Projective::identity(), |acc, v| acc + v[i].0),
            )
        })
        .collect())
}

/// Verify a partial signature against the share public key implied by the
/// group verification vector
pub fn verify_partial(
    vector: &[PublicKey],
    id: u64,
    message: &[u8],
    partial: &Signature,
) -> bool {
    evaluate_verification_vector(vector, id).verify(message, partial)
}

/// Lagrange-combine at least `threshold` partial signatures at x = 0
///
/// Participant ids are the x-coordinates and must be distinct and nonzero.
pub fn lagrange_combine(partials: &[(u64, Signature)]) -> Result<Signature> {
    if partials.is_empty() {
        return Err(Error::Crypto("no partial signatures to combine".into()));
    }
    let mut combined = G2Projective::identity();
    for (i, (id_i, partial)) in partials.iter().enumerate() {
        if *id_i == 0 {
            return Err(Error::Crypto("participant id 0 is not allowed".into()));
        }
        let x_i = Scalar::from(*id_i);
        let mut coefficient = Scalar::ONE;
        for (j, (id_j, _)) in partials.iter().enumerate() {
            if i == j {
                continue;
            }
            let x_j = Scalar::from(*id_j);
            let denominator = Option::<Scalar>::from((x_j - x_i).invert()).ok_or_else(|| {
                Error::Crypto(format!(
                    "duplicate participant id {id_i} in combination set"
                ))
            })?;
            coefficient *= x_j * denominator;
        }
        combined += partial.0 * coefficient;
    }
    Ok(Signature(combined))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let sk = SecretKey::random();
        let pk = sk.public_key();
        let sig = sk.sign(b"a signing root");
        assert!(pk.verify(b"a signing root", &sig));
        assert!(!pk.verify(b"a different root", &sig));
    }

    #[test]
    fn test_key_encoding_round_trip() {
        let sk = SecretKey::random();
        let restored = SecretKey::from_bytes(&sk.to_bytes()).unwrap();
        assert_eq!(restored.public_key(), sk.public_key());

        let pk = sk.public_key();
        assert_eq!(PublicKey::from_bytes(&pk.to_bytes()).unwrap(), pk);

        let sig = sk.sign(b"msg");
        assert_eq!(Signature::from_bytes(&sig.to_bytes()).unwrap(), sig);
    }

    #[test]
    fn test_share_verification_detects_corruption() {
        let polynomial = Polynomial::random(3).unwrap();
        let vector = polynomial.commitments();

        let good = polynomial.evaluate(4);
        assert!(verify_share(&good, &vector, 4));

        let bad = good + Scalar::ONE;
        assert!(!verify_share(&bad, &vector, 4));
        // A valid share presented under the wrong id must also fail.
        assert!(!verify_share(&good, &vector, 5));
    }

    /// Simulate the arithmetic of a full k-of-n generation and check that any
    /// k-sized subset produces a signature valid under the group key.
    #[test]
    fn test_threshold_signing_three_of_five() {
        let threshold = 3usize;
        let ids: Vec<u64> = vec![1, 2, 3, 4, 5];

        let polynomials: Vec<Polynomial> = (0..ids.len())
            .map(|_| Polynomial::random(threshold).unwrap())
            .collect();
        let vectors: Vec<Vec<PublicKey>> =
            polynomials.iter().map(|p| p.commitments()).collect();
        let group_vector = aggregate_verification_vectors(&vectors).unwrap();
        let group_key = group_vector[0];

        // Each participant's share is the sum of every polynomial at its id.
        let shares: Vec<Scalar> = ids
            .iter()
            .map(|id| {
                polynomials
                    .iter()
                    .fold(Scalar::ZERO, |acc, p| acc + p.evaluate(*id))
            })
            .collect();
        for (id, share) in ids.iter().zip(&shares) {
            assert!(verify_share(share, &group_vector, *id));
        }

        let message = b"attestation signing root";
        let partials: Vec<(u64, Signature)> = ids
            .iter()
            .zip(&shares)
            .map(|(id, share)| (*id, SecretKey::from_scalar(*share).sign(message)))
            .collect();
        for (id, partial) in &partials {
            assert!(verify_partial(&group_vector, *id, message, partial));
        }

        // Any k-subset combines to a valid group signature.
        let combined = lagrange_combine(&partials[..threshold]).unwrap();
        assert!(group_key.verify(message, &combined));
        let other_subset = [
            partials[0].clone(),
            partials[2].clone(),
            partials[4].clone(),
        ];
        let combined = lagrange_combine(&other_subset).unwrap();
        assert!(group_key.verify(message, &combined));

        // Fewer than k shares must not produce a valid signature.
        let short = lagrange_combine(&partials[..threshold - 1]).unwrap();
        assert!(!group_key.verify(message, &short));
    }

    #[test]
    fn test_lagrange_combine_rejects_duplicates() {
        let sk = SecretKey::random();
        let sig = sk.sign(b"msg");
        assert!(lagrange_combine(&[(1, sig), (1, sig)]).is_err());
        assert!(lagrange_combine(&[(0, sig)]).is_err());
    }
}
