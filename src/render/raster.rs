//! In-process SVG → PNG rasterization with resvg.

use std::sync::{Arc, OnceLock};

use super::RenderError;

/// Largest edge of an output image, in pixels. Larger requests are scaled
/// down to fit.
const MAX_EDGE_PX: f32 = 8192.0;

static FONTS: OnceLock<Arc<usvg::fontdb::Database>> = OnceLock::new();

/// System fonts, loaded once per process.
fn fonts() -> Arc<usvg::fontdb::Database> {
    FONTS
        .get_or_init(|| {
            let mut db = usvg::fontdb::Database::new();
            db.load_system_fonts();
            Arc::new(db)
        })
        .clone()
}

/// Rasterizes `svg` to a pixmap `scale` times its intrinsic size.
///
/// The intrinsic size comes from `width`/`height`, or the viewBox when
/// those are absent, so documents with arbitrary viewBox origins and
/// extents come out whole.
pub fn rasterize(svg: &str, scale: f32) -> Result<resvg::tiny_skia::Pixmap, RenderError> {
    if !(scale.is_finite() && scale > 0.0) {
        return Err(RenderError::Raster(format!("invalid scale {}", scale)));
    }

    let mut options = usvg::Options::default();
    options.fontdb = fonts();
    let tree = usvg::Tree::from_str(svg, &options)
        .map_err(|e| RenderError::Raster(format!("invalid SVG: {}", e)))?;

    let size = tree.size();
    let longest = size.width().max(size.height());
    let scale = scale.min(MAX_EDGE_PX / longest);
    let width = (size.width() * scale).round().max(1.0) as u32;
    let height = (size.height() * scale).round().max(1.0) as u32;

    let mut pixmap = resvg::tiny_skia::Pixmap::new(width, height).ok_or_else(|| {
        RenderError::Raster(format!("failed to allocate {}x{} surface", width, height))
    })?;
    pixmap.fill(resvg::tiny_skia::Color::WHITE);
    resvg::render(
        &tree,
        resvg::tiny_skia::Transform::from_scale(scale, scale),
        &mut pixmap.as_mut(),
    );
    Ok(pixmap)
}

pub fn svg_to_png(svg: &str, scale: f32) -> Result<Vec<u8>, RenderError> {
    rasterize(svg, scale)?
        .encode_png()
        .map_err(|e| RenderError::Raster(format!("failed to encode PNG: {}", e)))
}

/// [`svg_to_png`] on the blocking pool, for async callers.
pub async fn svg_to_png_blocking(svg: String, scale: f32) -> Result<Vec<u8>, RenderError> {
    tokio::task::spawn_blocking(move || svg_to_png(&svg, scale))
        .await
        .map_err(|e| RenderError::Raster(format!("render task failed: {}", e)))?
}

/// Width and height from a PNG header.
pub fn png_dimensions(png: &[u8]) -> Option<(u32, u32)> {
    if png.len() < 24 || &png[..8] != b"\x89PNG\r\n\x1a\n" || &png[12..16] != b"IHDR" {
        return None;
    }
    let w = u32::from_be_bytes(png[16..20].try_into().ok()?);
    let h = u32::from_be_bytes(png[20..24].try_into().ok()?);
    Some((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_png_honors_scale_and_viewbox() {
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="-50 -20 300 100"><rect x="-50" y="-20" width="300" height="100" fill="red"/></svg>"#;
        let png = svg_to_png(svg, 2.0).unwrap();
        assert_eq!(png_dimensions(&png), Some((600, 200)));
    }

    #[test]
    fn test_oversized_request_is_capped() {
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" width="4000" height="100"/>"#;
        let png = svg_to_png(svg, 4.0).unwrap();
        let (w, h) = png_dimensions(&png).unwrap();
        assert_eq!(w, 8192);
        assert!(h <= 205);
    }

    #[tokio::test]
    async fn test_blocking_pool_matches_inline_render() {
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" width="40" height="20"><rect width="40" height="20" fill="blue"/></svg>"#;
        let png = svg_to_png_blocking(svg.to_string(), 1.5).await.unwrap();
        assert_eq!(png, svg_to_png(svg, 1.5).unwrap());
        assert!(svg_to_png_blocking("not svg".to_string(), 1.0).await.is_err());
    }

    #[test]
    fn test_invalid_input() {
        assert!(matches!(
            svg_to_png("not svg", 1.0),
            Err(RenderError::Raster(_))
        ));
        assert!(matches!(
            svg_to_png(r#"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"/>"#, 0.0),
            Err(RenderError::Raster(_))
        ));
    }
}
