//! CLI plumbing shared by the subcommands: key files, repository opening,
//! and snapshot lookup by prefix.

use std::fs;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use camino::Utf8Path;
use data_encoding::HEXLOWER;
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::fs::FilesystemBackend;
use crate::codec::CipherKey;
use crate::mac::{Mac, MacKey};
use crate::repository::{Repository, RepositoryKey};
use crate::snapshot::SnapshotSigner;

pub mod archive;
pub mod backup;
pub mod check;
pub mod init;
pub mod ls;
pub mod restore;
pub mod snapshots;
pub mod sync;

pub(crate) const KEY_FILE: &str = "kloset.key";

/// The secrets, hex-encoded, next to the repository.
/// Good enough for a local store; remote backends want a real keyring.
#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    mac: String,
    cipher: Option<String>,
    signer_secret: Option<String>,
    signer_id: Option<Uuid>,
}

fn decode32(hex: &str, what: &str) -> Result<[u8; 32]> {
    let bytes = HEXLOWER
        .decode(hex.as_bytes())
        .with_context(|| format!("Couldn't decode the {what} key"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("The {what} key isn't 32 bytes"))
}

pub struct Credentials {
    pub key: RepositoryKey,
    pub signer: Option<SnapshotSigner>,
}

pub fn save_credentials(
    repository: &Utf8Path,
    key: &RepositoryKey,
    signer: Option<&SnapshotSigner>,
) -> Result<()> {
    let file = KeyFile {
        mac: HEXLOWER.encode(key.mac.as_bytes()),
        cipher: key
            .cipher
            .as_ref()
            .map(|c| HEXLOWER.encode(c.as_bytes())),
        signer_secret: signer.map(|s| HEXLOWER.encode(&s.secret_bytes())),
        signer_id: signer.map(|s| s.identity().identifier),
    };
    let path = repository.join(KEY_FILE);
    fs::write(&path, serde_json::to_vec_pretty(&file)?)
        .with_context(|| format!("Couldn't write {path}"))?;
    Ok(())
}

pub fn load_credentials(repository: &Utf8Path) -> Result<Credentials> {
    let path = repository.join(KEY_FILE);
    let raw = fs::read(&path).with_context(|| format!("Couldn't read {path}"))?;
    let file: KeyFile = serde_json::from_slice(&raw)
        .with_context(|| format!("Couldn't parse {path}"))?;

    let key = RepositoryKey {
        mac: MacKey::from_bytes(decode32(&file.mac, "MAC")?),
        cipher: file
            .cipher
            .as_deref()
            .map(|c| decode32(c, "cipher").map(CipherKey::from_bytes))
            .transpose()?,
    };
    let signer = match (file.signer_secret.as_deref(), file.signer_id) {
        (Some(secret), Some(id)) => {
            Some(SnapshotSigner::from_secret(decode32(secret, "signer")?, id))
        }
        _ => None,
    };
    Ok(Credentials { key, signer })
}

pub fn open_repository(repository: &Utf8Path) -> Result<(Arc<Repository>, Credentials)> {
    let credentials = load_credentials(repository)?;
    let backend = Arc::new(FilesystemBackend::new(repository));
    let repo = Repository::open(backend, credentials.key.clone())
        .with_context(|| format!("Couldn't open repository {repository}"))?;
    Ok((Arc::new(repo), credentials))
}

/// Resolve a snapshot from an ID prefix, or "latest".
pub fn find_snapshot(repo: &Arc<Repository>, prefix: &str) -> Result<Mac> {
    let snapshots = repo.snapshots();
    if snapshots.is_empty() {
        bail!("No snapshots taken yet");
    }

    if prefix == "latest" {
        let mut latest: Option<(i64, Mac)> = None;
        for mac in &snapshots {
            let header = repo.get_snapshot(mac)?;
            if latest.is_none() || header.timestamp > latest.unwrap().0 {
                latest = Some((header.timestamp, *mac));
            }
        }
        return Ok(latest.unwrap().1);
    }

    if let Ok(mac) = Mac::from_str(prefix) {
        return Ok(mac);
    }

    // Like Git, require at least a few digits of an ID.
    if prefix.len() < 4 {
        bail!("Provide a snapshot ID with at least 4 characters");
    }
    let mut matches = snapshots
        .into_iter()
        .filter(|mac| mac.to_string().starts_with(prefix))
        .collect::<Vec<_>>();
    match matches.len() {
        0 => bail!("No snapshots start with {prefix}"),
        1 => Ok(matches.pop().unwrap()),
        multiple => bail!("{multiple} different snapshots start with {prefix}"),
    }
}
