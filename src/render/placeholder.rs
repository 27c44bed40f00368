//! Error cards shown in place of a diagram that could not be rendered.
//!
//! Both forms state the error and carry the raw diagram source (escaped)
//! so the failure can be debugged from the artifact alone. The PNG form
//! also stores title, error and source as `tEXt` chunks.

use super::escape_xml;
use super::raster::rasterize;

const WIDTH: f64 = 800.0;
const MAX_SOURCE_LINES: usize = 40;
const MAX_LINE_CHARS: usize = 110;
const MAX_TEXT_CHUNK: usize = 8000;

pub fn error_svg(title: &str, message: &str, source: &str) -> String {
    let mut body = String::new();
    let mut y = 40.0;

    body.push_str(&format!(
        r##"<text x="20" y="{}" font-size="20" font-weight="bold" fill="#b85450">{}</text>"##,
        y,
        escape_xml(title)
    ));
    body.push('\n');
    y += 30.0;

    for line in message.lines().flat_map(|l| chunk_chars(l, 95)) {
        body.push_str(&format!(
            r##"<text x="20" y="{}" font-size="14" fill="#333333">{}</text>"##,
            y,
            escape_xml(&line)
        ));
        body.push('\n');
        y += 20.0;
    }

    y += 10.0;
    body.push_str(&format!(
        r##"<text x="20" y="{}" font-size="12" font-weight="bold" fill="#666666">Source:</text>"##,
        y
    ));
    body.push('\n');
    y += 18.0;

    let lines: Vec<&str> = source.lines().collect();
    for line in lines.iter().take(MAX_SOURCE_LINES) {
        let shown: String = line.chars().take(MAX_LINE_CHARS).collect();
        body.push_str(&format!(
            r##"<text x="20" y="{}" font-size="11" font-family="monospace" fill="#444444" xml:space="preserve">{}</text>"##,
            y,
            escape_xml(&shown)
        ));
        body.push('\n');
        y += 14.0;
    }
    if lines.len() > MAX_SOURCE_LINES {
        body.push_str(&format!(
            r##"<text x="20" y="{}" font-size="11" fill="#666666">… {} more lines</text>"##,
            y,
            lines.len() - MAX_SOURCE_LINES
        ));
        body.push('\n');
        y += 14.0;
    }

    let height = y + 20.0;
    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}" font-family="Helvetica, Arial, sans-serif">
<rect x="0" y="0" width="{w}" height="{h}" fill="#fff5f5" stroke="#b85450" stroke-width="2"/>
{body}</svg>
"##,
        w = WIDTH,
        h = height,
        body = body
    )
}

/// PNG rendition of [`error_svg`]. Never fails.
pub fn placeholder_png(title: &str, message: &str, source: &str) -> Vec<u8> {
    let pixmap = rasterize(&error_svg(title, message, source), 1.0).or_else(|e| {
        eprintln!("Warning: placeholder rasterization failed: {}", e);
        let mut blank = resvg::tiny_skia::Pixmap::new(WIDTH as u32, 120)
            .ok_or_else(|| e.clone())?;
        blank.fill(resvg::tiny_skia::Color::from_rgba8(255, 245, 245, 255));
        Ok::<_, super::RenderError>(blank)
    });

    let Ok(pixmap) = pixmap else {
        return MINIMAL_PNG.to_vec();
    };

    let rgba: Vec<u8> = pixmap
        .pixels()
        .iter()
        .flat_map(|p| {
            let c = p.demultiply();
            [c.red(), c.green(), c.blue(), c.alpha()]
        })
        .collect();

    let chunks = [
        ("Title", title.to_string()),
        ("Description", message.to_string()),
        ("Source", source.chars().take(MAX_TEXT_CHUNK).collect()),
    ];
    match encode_with_text(pixmap.width(), pixmap.height(), &rgba, &chunks) {
        Ok(png) => png,
        Err(e) => {
            eprintln!("Warning: placeholder PNG encoding failed: {}", e);
            pixmap.encode_png().unwrap_or_else(|_| MINIMAL_PNG.to_vec())
        }
    }
}

fn encode_with_text(
    width: u32,
    height: u32,
    rgba: &[u8],
    chunks: &[(&str, String)],
) -> Result<Vec<u8>, png::EncodingError> {
    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        for (key, text) in chunks {
            encoder.add_text_chunk(key.to_string(), latin1_safe(text))?;
        }
        let mut writer = encoder.write_header()?;
        writer.write_image_data(rgba)?;
    }
    Ok(out)
}

/// `tEXt` is Latin-1 only; keep printable ASCII and newlines.
fn latin1_safe(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\n' | ' '..='~' => c,
            '\t' => ' ',
            _ => '?',
        })
        .collect()
}

fn chunk_chars(line: &str, width: usize) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars.chunks(width).map(|c| c.iter().collect()).collect()
}

/// 1x1 white PNG.
pub(crate) const MINIMAL_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00, 0x90,
    0x77, 0x53, 0xde, 0x00, 0x00, 0x00, 0x0c, 0x49, 0x44, 0x41, 0x54, 0x08, 0xd7, 0x63, 0xf8,
    0xff, 0xff, 0x3f, 0x00, 0x05, 0xfe, 0x02, 0xfe, 0xdc, 0xcc, 0x59, 0xe7, 0x00, 0x00, 0x00,
    0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::raster::png_dimensions;

    fn contains(haystack: &[u8], needle: &str) -> bool {
        haystack
            .windows(needle.len())
            .any(|w| w == needle.as_bytes())
    }

    #[test]
    fn test_error_svg_escapes_source() {
        let svg = error_svg("Broken", "bad <input>", "<mxfile a=\"1\">\n  & more");
        assert!(svg.contains("bad &lt;input&gt;"));
        assert!(svg.contains("&lt;mxfile a=&quot;1&quot;&gt;"));
        assert!(svg.contains("  &amp; more"));
        assert!(!svg.contains("<mxfile"));
    }

    #[test]
    fn test_error_svg_truncates_long_source() {
        let source = (0..100).map(|i| format!("line {}", i)).collect::<Vec<_>>().join("\n");
        let svg = error_svg("T", "m", &source);
        assert!(svg.contains(">line 39<"));
        assert!(!svg.contains(">line 40<"));
        assert!(svg.contains("60 more lines"));
    }

    #[test]
    fn test_error_svg_is_valid_svg() {
        let svg = error_svg("T", "m", "x");
        usvg::Tree::from_str(&svg, &usvg::Options::default()).unwrap();
    }

    #[test]
    fn test_placeholder_png_carries_error_text() {
        let png = placeholder_png("D2 Diagram Generation Error", "exit status 1", "a -> b {");
        assert!(png_dimensions(&png).is_some());
        assert!(contains(&png, "tEXt"));
        assert!(contains(&png, "D2 Diagram Generation Error"));
        assert!(contains(&png, "exit status 1"));
        assert!(contains(&png, "a -> b {"));
    }

    #[test]
    fn test_latin1_safe() {
        assert_eq!(latin1_safe("a\tb\u{2014}c\nd"), "a b?c\nd");
    }

    #[test]
    fn test_minimal_png_header() {
        assert_eq!(png_dimensions(MINIMAL_PNG), Some((1, 1)));
    }
}
