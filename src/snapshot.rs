//! Snapshot headers: the one blob that makes a backup visible.
//!
//! A header names its sources, their VFS roots, and its metadata; its MAC
//! *is* the snapshot identifier, so the identifier field itself never
//! rides in the serialized bytes. Commit order guarantees the header is
//! written only after everything it references is durable, which is what
//! makes snapshot visibility atomic.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mac::Mac;
use crate::resource::{self, ResourceType, Version};
use crate::vfs::{Summary, VfsRoots};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub identifier: Uuid,
    /// ed25519 verifying key.
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImporterInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub origin: String,
    pub directory: String,
}

/// A named auxiliary index (today: the content-type index), pointing at a
/// blob that holds its tree descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Mac,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub importer: ImporterInfo,
    pub context: Vec<(String, String)>,
    pub vfs: VfsRoots,
    pub indexes: Vec<IndexDescriptor>,
    pub summary: Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub version: Version,
    /// Not serialized: the identifier is the header blob's MAC, filled in
    /// when the header is loaded or committed.
    #[serde(skip)]
    pub identifier: Mac,
    /// Nanoseconds since the epoch. Nanosecond resolution is what keeps
    /// back-to-back snapshots of identical trees distinct, since the
    /// identifier is derived from the serialized header.
    pub timestamp: i64,
    pub duration_ms: u64,
    pub identity: Option<Identity>,
    pub name: String,
    pub category: String,
    pub environment: String,
    pub perimeter: String,
    pub job: String,
    pub replicas: Vec<String>,
    pub classifications: Vec<String>,
    pub tags: Vec<String>,
    pub context: Vec<(String, String)>,
    pub sources: Vec<Source>,
}

impl SnapshotHeader {
    pub fn new(name: String) -> Self {
        let mut context = Vec::new();
        if let Ok(host) = hostname::get() {
            context.push(("hostname".to_owned(), host.to_string_lossy().into_owned()));
        }
        Self {
            version: resource::current_version(ResourceType::Snapshot),
            identifier: Mac::ZERO,
            timestamp: jiff::Timestamp::now().as_nanosecond() as i64,
            duration_ms: 0,
            identity: None,
            name,
            category: "default".to_owned(),
            environment: String::new(),
            perimeter: String::new(),
            job: String::new(),
            replicas: Vec::new(),
            classifications: Vec::new(),
            tags: Vec::new(),
            context,
            sources: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Internal(format!("header encoding: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Corrupt(format!("header decoding: {e}")))
    }

    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Signs snapshot headers with an ed25519 key tied to an identity.
pub struct SnapshotSigner {
    signing: SigningKey,
    identity: Identity,
}

impl SnapshotSigner {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        use rand::RngCore;
        rand::rng().fill_bytes(&mut secret);
        Self::from_secret(secret, Uuid::new_v4())
    }

    pub fn from_secret(secret: [u8; 32], identifier: Uuid) -> Self {
        let signing = SigningKey::from_bytes(&secret);
        let identity = Identity {
            identifier,
            public_key: signing.verifying_key().to_bytes().to_vec(),
        };
        Self { signing, identity }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Sign the header's MAC (the identifier-to-be).
    pub fn sign(&self, header_mac: &Mac) -> Vec<u8> {
        self.signing.sign(header_mac.as_bytes()).to_bytes().to_vec()
    }
}

pub fn verify_signature(identity: &Identity, header_mac: &Mac, signature: &[u8]) -> Result<()> {
    let key_bytes: [u8; 32] = identity
        .public_key
        .as_slice()
        .try_into()
        .map_err(|_| Error::Corrupt("identity public key isn't 32 bytes".into()))?;
    let verifying = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| Error::Corrupt("identity public key isn't a valid ed25519 point".into()))?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| Error::Corrupt("signature isn't 64 bytes".into()))?;
    verifying
        .verify(header_mac.as_bytes(), &Signature::from_bytes(&sig_bytes))
        .map_err(|_| Error::Unauthorized("snapshot signature verification failed".into()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_omits_identifier() -> Result<()> {
        let mut header = SnapshotHeader::new("nightly".to_owned());
        header.identifier = Mac::from_bytes([1; 32]);
        header.tags.push("prod".to_owned());

        let bytes = header.to_bytes()?;
        let decoded = SnapshotHeader::from_bytes(&bytes)?;
        // Everything round-trips except the identifier, which is derived.
        assert_eq!(decoded.identifier, Mac::ZERO);
        assert_eq!(decoded.name, header.name);
        assert_eq!(decoded.tags, header.tags);

        // And because it's skipped, it can't perturb the serialized MAC.
        let mut renamed = header.clone();
        renamed.identifier = Mac::from_bytes([2; 32]);
        assert_eq!(renamed.to_bytes()?, bytes);
        Ok(())
    }

    #[test]
    fn sign_and_verify() -> Result<()> {
        let signer = SnapshotSigner::generate();
        let mac = Mac::from_bytes([7; 32]);
        let signature = signer.sign(&mac);

        verify_signature(signer.identity(), &mac, &signature)?;

        let other_mac = Mac::from_bytes([8; 32]);
        assert!(matches!(
            verify_signature(signer.identity(), &other_mac, &signature),
            Err(Error::Unauthorized(_))
        ));

        let mut tampered = signature.clone();
        tampered[0] ^= 1;
        assert!(verify_signature(signer.identity(), &mac, &tampered).is_err());
        Ok(())
    }

    #[test]
    fn signer_round_trips_through_secret() {
        let signer = SnapshotSigner::generate();
        let again = SnapshotSigner::from_secret(
            signer.secret_bytes(),
            signer.identity().identifier,
        );
        assert_eq!(signer.identity(), again.identity());
    }
}
