//! Inline file payloads and their blobs.
//!
//! Files arrive base64 encoded, optionally zlib-deflated first. Each stored
//! blob carries `wi`/`wiq`/`wiqid` in its metadata so item and queue
//! deletion can find it again.

use std::collections::HashSet;
use std::io::Read;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use flate2::read::ZlibDecoder;
use serde_json::json;

use super::WorkitemEngine;
use crate::error::{Error, Result};
use crate::model::workitem::NewFile;
use crate::model::{Audit, Identity, WorkitemFile, WorkitemQueue};
use crate::store::Filter;

/// Decode a file payload into raw bytes.
pub fn decode(file: &NewFile) -> Result<Vec<u8>> {
    let Some(encoded) = file.file.as_deref().filter(|f| !f.is_empty()) else {
        return Err(Error::mandatory("file"));
    };
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| Error::Validation(format!("{} is not valid base64: {e}", file.filename)))?;
    if !file.compressed {
        return Ok(raw);
    }

    let mut inflated = Vec::new();
    ZlibDecoder::new(raw.as_slice())
        .read_to_end(&mut inflated)
        .map_err(|e| Error::Validation(format!("{} failed to inflate: {e}", file.filename)))?;
    Ok(inflated)
}

/// Content type by sniffing the bytes, then by extension.
pub fn content_type(bytes: &[u8], filename: &str) -> String {
    if let Some(kind) = infer::get(bytes) {
        return kind.mime_type().to_string();
    }
    let extension = filename.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("txt" | "log") => "text/plain",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("html" | "htm") => "text/html",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Normalize separators and split into (directory, base name).
pub fn split_path(filename: &str) -> (String, String) {
    let normalized = filename.replace('\\', "/");
    match normalized.rsplit_once('/') {
        Some((dir, base)) => (dir.to_string(), base.to_string()),
        None => (String::new(), normalized),
    }
}

impl WorkitemEngine {
    /// Store one file for `item_id`, returning the reference to record on
    /// the item.
    pub(crate) async fn store_file(
        &self,
        item_id: &str,
        queue: &WorkitemQueue,
        filename: &str,
        bytes: Vec<u8>,
        identity: &Identity,
    ) -> Result<WorkitemFile> {
        let (path, base) = split_path(filename);
        let mime = content_type(&bytes, &base);
        let mut metadata = json!({
            "name": base,
            "filename": filename,
            "path": path,
            "wi": item_id,
            "wiq": queue.name,
            "wiqid": queue.id,
            "uniquename": format!("{}-{base}", crate::model::new_id()),
            "_acl": queue.acl,
        });
        if let (Some(obj), serde_json::Value::Object(stamps)) = (
            metadata.as_object_mut(),
            serde_json::to_value(Audit::created_by(identity))?,
        ) {
            obj.extend(stamps);
        }

        let id = self.blobs.save(bytes, filename, &mime, metadata).await?;
        tracing::debug!(workitem = item_id, blob = %id, file = filename, "stored workitem file");
        Ok(WorkitemFile {
            name: filename.to_string(),
            filename: base,
            id,
            file: None,
        })
    }

    /// Decode and store every inline file. A file that fails is logged and
    /// skipped; it never fails the surrounding operation.
    pub(crate) async fn store_files(
        &self,
        item_id: &str,
        queue: &WorkitemQueue,
        files: &[NewFile],
        identity: &Identity,
    ) -> Vec<WorkitemFile> {
        let mut stored = Vec::with_capacity(files.len());
        for file in files {
            let result = match decode(file) {
                Ok(bytes) => {
                    self.store_file(item_id, queue, &file.filename, bytes, identity)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(reference) => stored.push(reference),
                Err(e) => {
                    tracing::error!(workitem = item_id, file = %file.filename, error = %e, "failed to store workitem file");
                }
            }
        }
        stored
    }

    /// Copy an existing blob for another item. The copy never shares the
    /// source blob id.
    pub(crate) async fn copy_file(
        &self,
        file: &WorkitemFile,
        item_id: &str,
        queue: &WorkitemQueue,
        identity: &Identity,
    ) -> Result<WorkitemFile> {
        let bytes = self
            .blobs
            .get(&file.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {} not found", file.id)))?;
        self.store_file(item_id, queue, &file.name, bytes, identity).await
    }

    /// Delete one blob, logging instead of failing.
    pub(crate) async fn delete_blob(&self, id: &str) {
        match self.blobs.delete(id).await {
            Ok(_) => {}
            Err(e) => tracing::error!(blob = id, error = %e, "failed to delete blob"),
        }
    }

    /// Delete every blob referenced by an item, directly or through its
    /// metadata back-reference. Returns how many were removed.
    pub(crate) async fn delete_item_blobs(&self, item_id: &str, files: &[WorkitemFile]) -> u64 {
        let mut ids: HashSet<String> = files.iter().map(|f| f.id.clone()).collect();
        match self.blobs.find(&Filter::eq("metadata.wi", item_id)).await {
            Ok(found) => ids.extend(found.into_iter().map(|b| b.id)),
            Err(e) => tracing::error!(workitem = item_id, error = %e, "failed to list workitem files"),
        }

        let mut deleted = 0;
        for id in ids {
            match self.blobs.delete(&id).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(workitem = item_id, blob = %id, error = %e, "failed to delete workitem file"),
            }
        }
        deleted
    }

    /// Delete every blob belonging to a queue's items.
    pub(crate) async fn delete_queue_blobs(&self, queue_id: &str) -> Result<u64> {
        let found = self.blobs.find(&Filter::eq("metadata.wiqid", queue_id)).await?;
        let mut deleted = 0;
        for blob in found {
            match self.blobs.delete(&blob.id).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(wiqid = queue_id, blob = %blob.id, error = %e, "failed to delete queue file"),
            }
        }
        Ok(deleted)
    }

    /// Fill in base64 content for each file reference.
    /// Fill in file contents. The item is already claimed, so an unreadable
    /// blob is logged and left without content.
    pub(crate) async fn load_file_contents(&self, files: &mut [WorkitemFile]) {
        for file in files {
            match self.blobs.get(&file.id).await {
                Ok(Some(bytes)) => file.file = Some(STANDARD.encode(bytes)),
                Ok(None) => {
                    tracing::warn!(blob = %file.id, filename = %file.filename, "workitem file blob missing");
                }
                Err(e) => {
                    tracing::warn!(blob = %file.id, filename = %file.filename, error = %e, "failed reading workitem file");
                }
            }
        }
    }
}
