//! QR rendering for pairing challenges.

use qrcode::render::svg;
use qrcode::{EcLevel, QrCode};

use crate::error::RelayError;

/// Rendered artifact edge length in pixels.
const QR_MIN_DIMENSION: u32 = 400;

/// Render a pairing challenge as a scannable SVG.
///
/// Error-correction level H so partially obscured screens still scan; the
/// default quiet zone is kept as the margin.
pub fn render_svg(challenge: &str) -> Result<String, RelayError> {
    let code = QrCode::with_error_correction_level(challenge.as_bytes(), EcLevel::H)
        .map_err(|e| RelayError::QrRender(e.to_string()))?;
    let image = code
        .render::<svg::Color>()
        .min_dimensions(QR_MIN_DIMENSION, QR_MIN_DIMENSION)
        .quiet_zone(true)
        .build();
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_svg() {
        let svg = render_svg("2@abcdef,key1,key2,secret").unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn test_render_svg_rejects_oversized_challenge() {
        // Level H tops out well below this payload size.
        let oversized = "x".repeat(5000);
        let err = render_svg(&oversized).unwrap_err();
        assert!(matches!(err, RelayError::QrRender(_)));
    }
}
