//! Payload checks shared by the entry point and the workers.
//!
//! Accepted combinations are `audio/*` with `.m4a` or `.wav`, and `video/*`
//! with `.mp4` or `.webm`. Beyond the declared metadata the first bytes must
//! carry the container signature matching the extension.

use std::path::Path;

use crate::error::MediaError;
use crate::{MediaPayload, Modality};

/// Default per-payload upload limit: 100 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 100 * 1024 * 1024;

const WEBM_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Wav,
    IsoBmff,
    Webm,
}

fn allowed_extensions(modality: Modality) -> &'static [(&'static str, Container)] {
    match modality {
        Modality::Audio => &[("m4a", Container::IsoBmff), ("wav", Container::Wav)],
        Modality::Video => &[("mp4", Container::IsoBmff), ("webm", Container::Webm)],
    }
}

/// Lower-cased extension of `filename`, without the dot.
pub fn extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Best-effort media type for a local file, used by the `submit` command.
pub fn guess_media_type(filename: &str) -> Option<(Modality, &'static str)> {
    match extension(filename)?.as_str() {
        "m4a" => Some((Modality::Audio, "audio/mp4")),
        "wav" => Some((Modality::Audio, "audio/wav")),
        "mp4" => Some((Modality::Video, "video/mp4")),
        "webm" => Some((Modality::Video, "video/webm")),
        _ => None,
    }
}

fn has_signature(bytes: &[u8], container: Container) -> bool {
    match container {
        Container::Wav => bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE",
        Container::IsoBmff => bytes.len() >= 8 && &bytes[4..8] == b"ftyp",
        Container::Webm => bytes.starts_with(&WEBM_MAGIC),
    }
}

pub fn validate(payload: &MediaPayload, modality: Modality, max_bytes: usize) -> Result<(), MediaError> {
    if payload.bytes.is_empty() {
        return Err(MediaError::Empty { modality });
    }
    if payload.bytes.len() > max_bytes {
        return Err(MediaError::TooLarge {
            modality,
            size: payload.bytes.len(),
            limit: max_bytes,
        });
    }

    let prefix = format!("{}/", modality.as_str());
    if !payload.media_type.to_ascii_lowercase().starts_with(&prefix) {
        return Err(MediaError::UnsupportedType {
            modality,
            media_type: payload.media_type.clone(),
        });
    }

    let ext = extension(&payload.filename);
    let container = allowed_extensions(modality)
        .iter()
        .find(|(allowed, _)| ext.as_deref() == Some(*allowed))
        .map(|(_, container)| *container)
        .ok_or_else(|| MediaError::UnsupportedExtension {
            modality,
            filename: payload.filename.clone(),
        })?;

    if !has_signature(&payload.bytes, container) {
        return Err(MediaError::Corrupt {
            modality,
            filename: payload.filename.clone(),
        });
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload(bytes: &[u8], filename: &str, media_type: &str) -> MediaPayload {
        MediaPayload {
            bytes: bytes.to_vec(),
            filename: filename.into(),
            media_type: media_type.into(),
        }
    }

    #[rstest]
    #[case(Modality::Audio, payload(b"RIFF\0\0\0\0WAVEdata", "a.wav", "audio/wav"))]
    #[case(Modality::Audio, payload(b"\0\0\0\x20ftypM4A ", "a.M4A", "audio/mp4"))]
    #[case(Modality::Video, payload(b"\0\0\0\x20ftypisom", "v.mp4", "video/mp4"))]
    #[case(Modality::Video, payload(&[0x1A, 0x45, 0xDF, 0xA3, 0x01], "v.webm", "video/webm"))]
    fn accepts_supported_media(#[case] modality: Modality, #[case] payload: MediaPayload) {
        assert_eq!(validate(&payload, modality, DEFAULT_MAX_PAYLOAD_BYTES), Ok(()));
    }

    #[test]
    fn rejects_empty_payload() {
        let empty = payload(b"", "a.wav", "audio/wav");
        assert_eq!(
            validate(&empty, Modality::Audio, 10),
            Err(MediaError::Empty { modality: Modality::Audio })
        );
    }

    #[test]
    fn rejects_oversized_payload() {
        let big = fixtures::wav(&[0u8; 64]);
        let err = validate(&big, Modality::Audio, 16).unwrap_err();
        assert!(matches!(err, MediaError::TooLarge { limit: 16, .. }));
    }

    #[rstest]
    #[case(Modality::Audio, "video/webm", "a.wav")]
    #[case(Modality::Video, "audio/wav", "v.webm")]
    #[case(Modality::Audio, "application/octet-stream", "a.wav")]
    fn rejects_wrong_media_type(#[case] modality: Modality, #[case] media_type: &str, #[case] filename: &str) {
        let p = payload(b"RIFF\0\0\0\0WAVE", filename, media_type);
        assert!(matches!(
            validate(&p, modality, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(MediaError::UnsupportedType { .. })
        ));
    }

    #[rstest]
    #[case(Modality::Audio, "audio/mpeg", "a.mp3")]
    #[case(Modality::Audio, "audio/wav", "wav")]
    #[case(Modality::Video, "video/quicktime", "v.mov")]
    fn rejects_wrong_extension(#[case] modality: Modality, #[case] media_type: &str, #[case] filename: &str) {
        let p = payload(b"RIFF\0\0\0\0WAVE", filename, media_type);
        assert!(matches!(
            validate(&p, modality, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(MediaError::UnsupportedExtension { .. })
        ));
    }

    #[test]
    fn rejects_corrupt_container() {
        let p = payload(b"definitely not a wave file", "a.wav", "audio/wav");
        assert!(matches!(
            validate(&p, Modality::Audio, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(MediaError::Corrupt { .. })
        ));
    }

    #[test]
    fn guesses_media_types_from_extension() {
        assert_eq!(guess_media_type("x.WAV"), Some((Modality::Audio, "audio/wav")));
        assert_eq!(guess_media_type("x.webm"), Some((Modality::Video, "video/webm")));
        assert_eq!(guess_media_type("x.txt"), None);
    }
}
