//! Blossom media uploads.
//!
//! Content-addressed blobs live in S3 under `blobs/{groupID}/{sha256}` for
//! group uploads, `blobs/{sha256}` otherwise. Admission is gated by a
//! signed kind-24242 authorization event; uploads into a group require
//! membership.

use crate::{
    constants::{KIND_BLOB_AUTH, MAX_BLOB_SIZE},
    nostr::{groups::GroupsService, tag_value, tag_values},
};
use aws_sdk_s3::{primitives::ByteStream, Client as S3Client};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use nostr::{Event as NostrEvent, Kind};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// S3 connection settings for blob storage.
#[derive(Debug, Clone)]
pub struct BlossomConfig {
    /// Bucket holding the blobs.
    pub bucket: String,
    /// Public URL blobs are served from.
    pub service_url: String,
}

/// A rejected request: HTTP status plus a user-visible reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRejection {
    /// HTTP status to answer with.
    pub status: u16,
    /// Reason reported to the client.
    pub reason: String,
}

fn rejection(status: u16, reason: impl Into<String>) -> BlobRejection {
    BlobRejection { status, reason: reason.into() }
}

/// Blob descriptor returned after a successful upload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BlobDescriptor {
    /// URL the blob is reachable at.
    pub url: String,
    /// Content hash, hex.
    pub sha256: String,
    /// Blob size in bytes.
    pub size: usize,
    /// Sniffed content type.
    #[serde(rename = "type")]
    pub content_type: String,
    /// Upload time, unix seconds.
    pub uploaded: u64,
}

/// Stores and serves content-addressed blobs.
#[derive(Debug)]
pub struct BlossomService {
    s3: S3Client,
    config: BlossomConfig,
    groups: GroupsService,
}

impl BlossomService {
    /// Creates the service over an S3 client.
    pub fn new(s3: S3Client, config: BlossomConfig, groups: GroupsService) -> Self {
        Self { s3, config, groups }
    }

    /// Admits or rejects an upload, returning the group the blob belongs
    /// to (if any).
    pub async fn check_upload(
        &self,
        auth_header: Option<&str>,
        body: &[u8],
    ) -> Result<Option<String>, BlobRejection> {
        if body.len() > MAX_BLOB_SIZE {
            return Err(rejection(
                413,
                format!("file too large, max size is {} MB", MAX_BLOB_SIZE / (1024 * 1024)),
            ));
        }

        let sha256 = alloy::hex::encode(Sha256::digest(body));
        let auth = parse_auth_event(auth_header, "upload", &sha256)?;

        let group_id = tag_value(&auth, "h").map(str::to_string);
        if let Some(group_id) = &group_id {
            let member = self
                .groups
                .is_member(&auth.pubkey.to_hex(), group_id)
                .await
                .map_err(|err| {
                    warn!(%err, "membership check failed");
                    rejection(500, "error checking group membership")
                })?;
            if !member {
                return Err(rejection(403, "not a member of the specified group"));
            }
        }

        Ok(group_id)
    }

    /// Stores an admitted blob and returns its descriptor.
    pub async fn store_blob(
        &self,
        group_id: Option<&str>,
        body: Vec<u8>,
    ) -> Result<BlobDescriptor, BlobRejection> {
        let sha256 = alloy::hex::encode(Sha256::digest(&body));
        let key = build_s3_key(group_id, &sha256);
        let content_type = detect_content_type(&body);
        let size = body.len();

        self.s3
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| {
                warn!(%err, key, "failed to store blob");
                rejection(500, "failed to store blob")
            })?;

        debug!(sha256, group = group_id.unwrap_or(""), "stored blob");

        Ok(BlobDescriptor {
            url: format!("{}/{sha256}", self.config.service_url.trim_end_matches('/')),
            sha256,
            size,
            content_type: content_type.to_string(),
            uploaded: chrono::Utc::now().timestamp() as u64,
        })
    }

    /// Loads a blob by hash, wherever it lives in the bucket.
    pub async fn load_blob(&self, sha256: &str) -> Result<(Vec<u8>, String), BlobRejection> {
        let key = self.find_blob_key(sha256).await?;

        let object = self
            .s3
            .get_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|_| rejection(404, "blob not found"))?;

        let content_type = object
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = object
            .body
            .collect()
            .await
            .map_err(|_| rejection(500, "failed to read blob"))?
            .into_bytes()
            .to_vec();

        Ok((body, content_type))
    }

    /// Deletes a blob after validating the delete authorization.
    pub async fn delete_blob(
        &self,
        auth_header: Option<&str>,
        sha256: &str,
    ) -> Result<(), BlobRejection> {
        parse_auth_event(auth_header, "delete", sha256)?;

        let key = self.find_blob_key(sha256).await?;
        self.s3
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|_| rejection(500, "failed to delete blob"))?;

        Ok(())
    }

    /// Finds the S3 key for a hash: the ungrouped location first, then a
    /// scan of the group folders.
    async fn find_blob_key(&self, sha256: &str) -> Result<String, BlobRejection> {
        let direct = build_s3_key(None, sha256);
        let head = self
            .s3
            .head_object()
            .bucket(&self.config.bucket)
            .key(&direct)
            .send()
            .await;
        if head.is_ok() {
            return Ok(direct);
        }

        let mut continuation: Option<String> = None;
        loop {
            let mut req = self
                .s3
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix("blobs/");
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }

            let page = req
                .send()
                .await
                .map_err(|_| rejection(500, "failed to list blobs"))?;

            for object in page.contents() {
                if let Some(key) = object.key() {
                    if key.ends_with(&format!("/{sha256}")) {
                        return Ok(key.to_string());
                    }
                }
            }

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Err(rejection(404, "blob not found"))
    }
}

/// Validates the `Authorization: Nostr base64(event)` header: a signed
/// kind-24242 event carrying the action, the blob hash and an unexpired
/// expiration.
fn parse_auth_event(
    header: Option<&str>,
    action: &str,
    expected_sha256: &str,
) -> Result<NostrEvent, BlobRejection> {
    let header = header.ok_or_else(|| rejection(404, "authorization required"))?;

    let encoded = header
        .strip_prefix("Nostr ")
        .ok_or_else(|| rejection(404, "invalid authorization scheme"))?;

    let decoded = BASE64
        .decode(encoded.trim())
        .map_err(|_| rejection(400, "invalid authorization encoding"))?;
    let event: NostrEvent = serde_json::from_slice(&decoded)
        .map_err(|_| rejection(400, "invalid authorization event"))?;

    if event.verify().is_err() {
        return Err(rejection(404, "invalid authorization signature"));
    }

    if event.kind != Kind::Custom(KIND_BLOB_AUTH) {
        return Err(rejection(400, "invalid authorization kind"));
    }

    if !tag_values(&event, "t").any(|t| t == action) {
        return Err(rejection(400, format!("authorization is not for {action}")));
    }

    let expiration = tag_value(&event, "expiration")
        .and_then(|v| v.parse::<i64>().ok())
        .ok_or_else(|| rejection(400, "missing expiration in auth event"))?;
    if expiration < chrono::Utc::now().timestamp() {
        return Err(rejection(404, "authorization expired"));
    }

    let hash = tag_value(&event, "x")
        .ok_or_else(|| rejection(400, "missing file hash in auth event"))?;
    if hash != expected_sha256 {
        return Err(rejection(400, "file hash does not match authorization"));
    }

    Ok(event)
}

fn build_s3_key(group_id: Option<&str>, sha256: &str) -> String {
    match group_id {
        Some(group_id) if !group_id.is_empty() => format!("blobs/{group_id}/{sha256}"),
        _ => format!("blobs/{sha256}"),
    }
}

/// Sniffs the content type from magic bytes, falling back to octet-stream.
fn detect_content_type(data: &[u8]) -> &'static str {
    if data.len() < 4 {
        return "application/octet-stream";
    }

    match data {
        _ if data.starts_with(&[0xFF, 0xD8, 0xFF]) => "image/jpeg",
        _ if data.starts_with(&[0x89, b'P', b'N', b'G']) => "image/png",
        _ if data.starts_with(b"GIF8") => "image/gif",
        _ if data.starts_with(b"RIFF") && data.len() > 11 && &data[8..12] == b"WEBP" => {
            "image/webp"
        }
        _ if data.starts_with(b"RIFF") && data.len() > 11 && &data[8..12] == b"WAVE" => {
            "audio/wav"
        }
        _ if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) => "video/webm",
        _ if data.starts_with(b"ID3") || data.starts_with(&[0xFF, 0xFB]) => "audio/mpeg",
        _ if data.starts_with(b"OggS") => "audio/ogg",
        _ if data.starts_with(b"%PDF") => "application/pdf",
        _ if data.starts_with(b"<svg") => "image/svg+xml",
        _ if data.starts_with(b"{") || data.starts_with(b"[") => "application/json",
        _ if is_text(data) => "text/plain",
        _ => "application/octet-stream",
    }
}

fn is_text(data: &[u8]) -> bool {
    data.iter()
        .take(512)
        .all(|b| *b >= 32 || matches!(b, b'\n' | b'\r' | b'\t'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{EventBuilder, Keys, Tag};

    fn auth_header(keys: &Keys, action: &str, sha256: &str, expiration: i64) -> String {
        let event = EventBuilder::new(Kind::Custom(KIND_BLOB_AUTH), "")
            .tags([
                Tag::parse(["t", action]).unwrap(),
                Tag::parse(["x", sha256]).unwrap(),
                Tag::parse(["expiration", &expiration.to_string()]).unwrap(),
            ])
            .sign_with_keys(keys)
            .unwrap();

        format!("Nostr {}", BASE64.encode(serde_json::to_string(&event).unwrap()))
    }

    fn sha_hex(body: &[u8]) -> String {
        alloy::hex::encode(Sha256::digest(body))
    }

    #[test]
    fn accepts_valid_upload_auth() {
        let keys = Keys::generate();
        let body = b"hello world";
        let sha = sha_hex(body);
        let header = auth_header(&keys, "upload", &sha, chrono::Utc::now().timestamp() + 60);

        let event = parse_auth_event(Some(&header), "upload", &sha).unwrap();
        assert_eq!(event.pubkey, keys.public_key());
    }

    #[test]
    fn rejects_missing_and_expired_auth() {
        let keys = Keys::generate();
        let sha = sha_hex(b"data");

        assert_eq!(parse_auth_event(None, "upload", &sha).unwrap_err().status, 404);

        let expired = auth_header(&keys, "upload", &sha, chrono::Utc::now().timestamp() - 1);
        assert_eq!(parse_auth_event(Some(&expired), "upload", &sha).unwrap_err().status, 404);
    }

    #[test]
    fn rejects_wrong_action_and_hash() {
        let keys = Keys::generate();
        let sha = sha_hex(b"data");
        let header = auth_header(&keys, "delete", &sha, chrono::Utc::now().timestamp() + 60);

        let err = parse_auth_event(Some(&header), "upload", &sha).unwrap_err();
        assert_eq!(err.status, 400);
        assert!(err.reason.contains("not for upload"));

        let header = auth_header(&keys, "upload", &sha, chrono::Utc::now().timestamp() + 60);
        let err = parse_auth_event(Some(&header), "upload", &sha_hex(b"other")).unwrap_err();
        assert!(err.reason.contains("hash does not match"));
    }

    #[test]
    fn rejects_tampered_auth() {
        let keys = Keys::generate();
        let sha = sha_hex(b"data");
        let header = auth_header(&keys, "upload", &sha, chrono::Utc::now().timestamp() + 60);

        // Re-encode with modified content.
        let encoded = header.strip_prefix("Nostr ").unwrap();
        let mut event: serde_json::Value =
            serde_json::from_slice(&BASE64.decode(encoded).unwrap()).unwrap();
        event["content"] = serde_json::json!("tampered");
        let tampered = format!("Nostr {}", BASE64.encode(event.to_string()));

        assert_eq!(parse_auth_event(Some(&tampered), "upload", &sha).unwrap_err().status, 404);
    }

    #[test]
    fn builds_grouped_keys() {
        assert_eq!(build_s3_key(Some("g1"), "abc"), "blobs/g1/abc");
        assert_eq!(build_s3_key(None, "abc"), "blobs/abc");
        assert_eq!(build_s3_key(Some(""), "abc"), "blobs/abc");
    }

    #[test]
    fn sniffs_content_types() {
        assert_eq!(detect_content_type(&[0xFF, 0xD8, 0xFF, 0x00]), "image/jpeg");
        assert_eq!(detect_content_type(&[0x89, b'P', b'N', b'G', 0x0D]), "image/png");
        assert_eq!(detect_content_type(b"%PDF-1.4"), "application/pdf");
        assert_eq!(detect_content_type(b"{\"a\":1}"), "application/json");
        assert_eq!(detect_content_type(b"plain text here"), "text/plain");
        assert_eq!(detect_content_type(&[0x00, 0x01, 0x02, 0x03]), "application/octet-stream");
    }
}
