//! Copy a snapshot into another repository.
//!
//! MACs are keyed, so nothing can be copied byte-for-byte: every chunk,
//! object, entry, and tree node is re-MACed under the destination's key
//! on the way over. Blobs the destination already holds are skipped,
//! which makes a second run of the same sync write nothing at all.

use std::sync::Arc;

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use tracing::*;

use crate::btree::{BTree, TreeDescriptor, byte_order, path_order};
use crate::cache::MemoryStore;
use crate::cancel::CancelToken;
use crate::error::Error;
use crate::lock;
use crate::mac::Mac;
use crate::object::Object;
use crate::packer::Packer;
use crate::repository::Repository;
use crate::resource::ResourceType;
use crate::snapshot::{IndexDescriptor, Source};
use crate::vfs::{Filesystem, VfsRoots};

/// Copy `snapshot_id` from `src` into `dst`, returning the identifier it
/// gets under the destination's key.
pub fn synchronize(
    src: &Arc<Repository>,
    snapshot_id: &Mac,
    dst: &Arc<Repository>,
    cancel: &CancelToken,
) -> Result<Mac> {
    let _src_lock = lock::acquire_shared(src)?;
    let _dst_lock = lock::acquire_shared(dst)?;

    let header = src.get_snapshot(snapshot_id)?;
    info!(
        "Synchronizing snapshot {} -> repository {}",
        snapshot_id.short_name(),
        dst.id()
    );

    let txn = {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Mac::from_bytes(bytes)
    };
    let packer = Packer::spawn(
        dst.clone(),
        Arc::new(MemoryStore::new()),
        txn,
        cancel.clone(),
    );

    let outcome: Result<Mac> = (|| {
        let mut new_sources = Vec::with_capacity(header.sources.len());
        for source in &header.sources {
            new_sources.push(copy_source(src, dst, &packer, source, cancel)?);
        }

        let mut new_header = (*header).clone();
        new_header.sources = new_sources;
        // The signature binds the header MAC under the *source* key;
        // it can't survive re-keying, and we don't hold the signing key.
        new_header.identity = None;

        let header_bytes = new_header.to_bytes()?;
        let identifier = dst.mac(&header_bytes);
        packer.put_blob_if_not_exists(ResourceType::Snapshot, identifier, header_bytes)?;
        Ok(identifier)
    })();

    let identifier = match outcome {
        Ok(identifier) => identifier,
        Err(e) => {
            cancel.cancel();
            let _ = packer.finish();
            return Err(e);
        }
    };

    packer.finish()?;
    dst.flush_transaction()?;
    info!(
        "Snapshot {} is {} at the destination",
        snapshot_id.short_name(),
        identifier.short_name()
    );
    Ok(identifier)
}

fn copy_source(
    src: &Arc<Repository>,
    dst: &Arc<Repository>,
    packer: &Packer,
    source: &Source,
    cancel: &CancelToken,
) -> Result<Source> {
    let fs = Filesystem::open(src.clone(), &source.vfs, None);

    // Same source object -> same destination object; don't re-copy
    // content for every hard link.
    let mut object_map: FxHashMap<Mac, (Mac, String)> = FxHashMap::default();

    let mut entries = BTree::new(path_order);
    let mut content_types = BTree::new(byte_order::<String>);

    for item in fs.walk("/")? {
        cancel.check()?;
        let (path, mut entry) = item?;

        if let Some(src_object) = entry.object {
            let (dst_object, content_type) = match object_map.get(&src_object) {
                Some(found) => found.clone(),
                None => {
                    let copied = copy_object(src, dst, packer, &src_object, cancel)
                        .with_context(|| format!("Couldn't copy content of {path}"))?;
                    object_map.insert(src_object, copied.clone());
                    copied
                }
            };
            entry.object = Some(dst_object);

            let entry_bytes = entry.to_bytes()?;
            let entry_mac = dst.mac(&entry_bytes);
            packer.put_blob_if_not_exists(ResourceType::VfsEntry, entry_mac, entry_bytes)?;
            entries.insert(path.clone(), entry_mac);
            content_types.insert(format!("/{content_type}{path}"), entry_mac);
        } else {
            let entry_bytes = entry.to_bytes()?;
            let entry_mac = dst.mac(&entry_bytes);
            packer.put_blob_if_not_exists(ResourceType::VfsEntry, entry_mac, entry_bytes)?;
            entries.insert(path.clone(), entry_mac);
        }
    }

    let mut errors = BTree::new(path_order);
    for item in fs.errors("/")? {
        cancel.check()?;
        let bytes = item.to_bytes()?;
        let mac = dst.mac(&bytes);
        packer.put_blob_if_not_exists(ResourceType::ErrorEntry, mac, bytes)?;
        errors.insert(item.name.clone(), mac);
    }

    let mut xattrs = BTree::new(byte_order::<String>);
    for (key, mut item) in fs.xattr_items()? {
        cancel.check()?;
        let (dst_object, _) = copy_object(src, dst, packer, &item.object, cancel)
            .with_context(|| format!("Couldn't copy xattr {key}"))?;
        item.object = dst_object;
        let bytes = item.to_bytes()?;
        let mac = dst.mac(&bytes);
        packer.put_blob_if_not_exists(ResourceType::XattrEntry, mac, bytes)?;
        xattrs.insert(key, mac);
    }

    let roots = VfsRoots {
        entries: persist_tree(dst, packer, &entries, ResourceType::VfsNode)?,
        errors: persist_tree(dst, packer, &errors, ResourceType::ErrorNode)?,
        xattrs: persist_tree(dst, packer, &xattrs, ResourceType::XattrNode)?,
    };

    let indexes = if content_types.is_empty() {
        Vec::new()
    } else {
        let descriptor = persist_tree(dst, packer, &content_types, ResourceType::BtreeNode)?;
        let descriptor_bytes = descriptor.to_bytes()?;
        let descriptor_mac = dst.mac(&descriptor_bytes);
        packer.put_blob_if_not_exists(
            ResourceType::BtreeRoot,
            descriptor_mac,
            descriptor_bytes,
        )?;
        vec![IndexDescriptor {
            name: "content-type".to_owned(),
            kind: "btree".to_owned(),
            value: descriptor_mac,
        }]
    };

    Ok(Source {
        importer: source.importer.clone(),
        context: source.context.clone(),
        vfs: roots,
        indexes,
        summary: source.summary.clone(),
    })
}

/// Copy one object and its chunks, re-keying everything.
fn copy_object(
    src: &Arc<Repository>,
    dst: &Arc<Repository>,
    packer: &Packer,
    src_object: &Mac,
    cancel: &CancelToken,
) -> Result<(Mac, String)> {
    let object = Object::from_bytes(&src.get_blob(ResourceType::Object, src_object)?)?;

    let mut content_hasher = dst.codec().hasher();
    let mut new_chunks = Vec::with_capacity(object.chunks.len());
    for chunk in &object.chunks {
        cancel.check()?;
        let bytes = src.get_blob(ResourceType::Chunk, &chunk.content_mac)?;
        if bytes.len() != chunk.length as usize {
            return Err(Error::Corrupt(format!(
                "chunk {} is {} bytes, object says {}",
                chunk.content_mac,
                bytes.len(),
                chunk.length
            ))
            .into());
        }
        content_hasher.update(&bytes);
        let dst_mac = dst.mac(&bytes);
        let mut new_chunk = *chunk;
        new_chunk.content_mac = dst_mac;
        packer.put_blob_if_not_exists(ResourceType::Chunk, dst_mac, bytes)?;
        new_chunks.push(new_chunk);
    }

    let mut new_object = Object::new(
        content_hasher.finalize(),
        object.content_type.clone(),
        object.entropy,
        new_chunks,
    );
    new_object.flags = object.flags;

    let bytes = new_object.to_bytes()?;
    let mac = dst.mac(&bytes);
    packer.put_blob_if_not_exists(ResourceType::Object, mac, bytes)?;
    Ok((mac, object.content_type))
}

fn persist_tree(
    dst: &Arc<Repository>,
    packer: &Packer,
    tree: &BTree<String, Mac>,
    node_type: ResourceType,
) -> Result<TreeDescriptor> {
    let descriptor = tree.persist(&mut |node| {
        let bytes = rmp_serde::to_vec(node)
            .map_err(|e| Error::Internal(format!("tree node encoding: {e}")))?;
        let mac = dst.mac(&bytes);
        packer
            .put_blob_if_not_exists(node_type, mac, bytes)
            .map_err(|e| Error::Internal(format!("{e:#}")))?;
        Ok(mac)
    })?;
    Ok(descriptor)
}
