use image::{DynamicImage, GenericImageView};
use thiserror::Error;

/// Payloads longer than this are treated as hex-encoded image content.
/// A size heuristic, not a format sniff; the boundary value itself is text.
pub const BINARY_THRESHOLD: usize = 2000;

/// Maximum display envelope for decoded images, handed to the rendering
/// boundary as a hint only.
pub const MAX_DISPLAY_WIDTH: u32 = 400;
pub const MAX_DISPLAY_HEIGHT: u32 = 350;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("payload is not valid UTF-8: {0}")]
    EncodingError(#[from] std::string::FromUtf8Error),
    #[error("image payload could not be decoded: {0}")]
    DecodeError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Text,
    Binary,
}

pub fn classify(payload: &[u8]) -> PayloadKind {
    if payload.len() > BINARY_THRESHOLD {
        PayloadKind::Binary
    } else {
        PayloadKind::Text
    }
}

/// A decoded inbound image with its natural dimensions and the display fit
/// within the maximum envelope.
pub struct DecodedImage {
    pub image: DynamicImage,
    pub width: u32,
    pub height: u32,
    pub display_width: u32,
    pub display_height: u32,
}

/// Decodes a hex-encoded image payload. Both a hex failure and an image
/// format failure are `DecodeError`; the message is dropped, never persisted.
pub fn decode_image(hex_payload: &str) -> Result<DecodedImage, ClassifyError> {
    let bytes = hex::decode(hex_payload.trim())
        .map_err(|e| ClassifyError::DecodeError(e.to_string()))?;
    let image =
        image::load_from_memory(&bytes).map_err(|e| ClassifyError::DecodeError(e.to_string()))?;

    let (width, height) = image.dimensions();
    let (display_width, display_height) = fit_within(width, height);
    Ok(DecodedImage {
        image,
        width,
        height,
        display_width,
        display_height,
    })
}

/// Scales natural dimensions to fit the display envelope, preserving aspect
/// ratio. Images already inside the envelope are left alone.
pub fn fit_within(width: u32, height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (width, height);
    }
    let scale = f64::min(
        1.0,
        f64::min(
            MAX_DISPLAY_WIDTH as f64 / width as f64,
            MAX_DISPLAY_HEIGHT as f64 / height as f64,
        ),
    );
    (
        (width as f64 * scale).round() as u32,
        (height as f64 * scale).round() as u32,
    )
}

/// One telemetry line: the first comma-separated field is its timestamp,
/// the full line is retained verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryLine {
    pub timestamp: String,
    pub raw_line: String,
}

/// A parsed text payload. The first line is the device identity assertion
/// embedded in the body, not taken from the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPayload {
    pub imei: String,
    pub lines: Vec<TelemetryLine>,
    pub malformed: usize,
}

pub fn parse_text(payload: &[u8]) -> Result<TextPayload, ClassifyError> {
    let text = String::from_utf8(payload.to_vec())?;
    let trimmed = text.trim();

    let mut lines = trimmed.lines();
    let imei = lines.next().unwrap_or_default().trim().to_string();

    let mut parsed = Vec::new();
    let mut malformed = 0usize;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            malformed += 1;
            continue;
        }
        let timestamp = line.split(',').next().unwrap_or_default().to_string();
        parsed.push(TelemetryLine {
            timestamp,
            raw_line: line.to_string(),
        });
    }

    Ok(TextPayload {
        imei,
        lines: parsed,
        malformed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_boundary_is_text() {
        assert_eq!(classify(&vec![b'x'; 2000]), PayloadKind::Text);
        assert_eq!(classify(&vec![b'x'; 2001]), PayloadKind::Binary);
        assert_eq!(classify(b""), PayloadKind::Text);
    }

    #[test]
    fn invalid_utf8_is_an_encoding_error() {
        let payload = [0xff, 0xfe, 0x00, 0x41];
        match parse_text(&payload) {
            Err(ClassifyError::EncodingError(_)) => {}
            other => panic!("expected EncodingError, got {:?}", other.err()),
        }
    }

    #[test]
    fn first_line_is_the_imei_claim() {
        let payload = b"123\n2024-01-01T00:00:00,+40.7,-74.0\n2024-01-01T00:00:05,+40.8,-74.1";
        let parsed = parse_text(payload).unwrap();
        assert_eq!(parsed.imei, "123");
        assert_eq!(parsed.lines.len(), 2);
        assert_eq!(parsed.lines[0].timestamp, "2024-01-01T00:00:00");
        assert_eq!(parsed.lines[0].raw_line, "2024-01-01T00:00:00,+40.7,-74.0");
        assert_eq!(parsed.malformed, 0);
    }

    #[test]
    fn blank_lines_are_counted_not_fatal() {
        let payload = b"123\n\n2024-01-01T00:00:00,+40.7,-74.0\n   \n";
        let parsed = parse_text(payload).unwrap();
        assert_eq!(parsed.lines.len(), 1);
        assert_eq!(parsed.malformed, 2);
    }

    #[test]
    fn line_without_commas_keeps_full_line_as_timestamp() {
        let parsed = parse_text(b"123\nstatus-ok").unwrap();
        assert_eq!(parsed.lines[0].timestamp, "status-ok");
        assert_eq!(parsed.lines[0].raw_line, "status-ok");
    }

    #[test]
    fn display_fit_preserves_aspect_ratio() {
        assert_eq!(fit_within(200, 100), (200, 100));
        assert_eq!(fit_within(800, 400), (400, 200));
        assert_eq!(fit_within(400, 700), (200, 350));
        assert_eq!(fit_within(0, 10), (0, 10));
    }

    #[test]
    fn bad_hex_is_a_decode_error() {
        match decode_image("zz-not-hex") {
            Err(ClassifyError::DecodeError(_)) => {}
            other => panic!("expected DecodeError, got {:?}", other.err().map(|e| e.to_string())),
        }
    }

    #[test]
    fn hex_of_garbage_bytes_is_a_decode_error() {
        // Valid hex, not a valid image.
        match decode_image("deadbeef") {
            Err(ClassifyError::DecodeError(_)) => {}
            _ => panic!("expected DecodeError"),
        }
    }
}
