use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::message::ImageAttachment;

/// Reads an image from disk and encodes it for inline transport.
///
/// Unreadable files are reported and skipped rather than failing the
/// submission that carries them.
pub async fn encode_image_file(path: impl AsRef<Path>) -> Option<ImageAttachment> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(bytes) => Some(encode_image_bytes(&bytes)),
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "failed to read attachment; dropping it"
            );
            None
        }
    }
}

/// Base64-encodes raw image bytes, sniffing the mime type from magic bytes.
pub fn encode_image_bytes(bytes: &[u8]) -> ImageAttachment {
    ImageAttachment {
        mime_type: sniff_mime_type(bytes).to_string(),
        base64_data: BASE64.encode(bytes),
    }
}

fn sniff_mime_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if bytes.starts_with(b"\xff\xd8\xff") {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_common_image_formats() {
        assert_eq!(
            encode_image_bytes(b"\x89PNG\r\n\x1a\n....").mime_type,
            "image/png"
        );
        assert_eq!(encode_image_bytes(b"\xff\xd8\xff\xe0..").mime_type, "image/jpeg");
        assert_eq!(encode_image_bytes(b"GIF89a......").mime_type, "image/gif");
        assert_eq!(
            encode_image_bytes(b"RIFF\x00\x00\x00\x00WEBPVP8 ").mime_type,
            "image/webp"
        );
        assert_eq!(
            encode_image_bytes(b"plain text").mime_type,
            "application/octet-stream"
        );
    }

    #[test]
    fn encodes_base64_payload() {
        let attachment = encode_image_bytes(b"hello");
        assert_eq!(attachment.base64_data, "aGVsbG8=");
    }

    #[tokio::test]
    async fn missing_file_yields_none() {
        let dir = tempfile::tempdir().expect("temp dir");
        let absent = dir.path().join("nope.png");
        assert!(encode_image_file(&absent).await.is_none());
    }

    #[tokio::test]
    async fn readable_file_round_trips() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("tiny.png");
        tokio::fs::write(&path, b"\x89PNG\r\n\x1a\nabc")
            .await
            .expect("write fixture");

        let attachment = encode_image_file(&path).await.expect("attachment");
        assert_eq!(attachment.mime_type, "image/png");
        assert!(attachment.data_url().starts_with("data:image/png;base64,"));
    }
}
