use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use std::path::{Path, PathBuf};
use tracing::debug;

/// JPEG qualities tried in order; the first result under the ceiling wins.
const QUALITIES: [u8; 4] = [85, 75, 65, 55];

/// Path of the recompressed copy: `<dir>/<stem>_compressed.jpg`.
pub fn compressed_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    path.with_file_name(format!("{}_compressed.jpg", stem))
}

/// Re-encode an image as JPEG at decreasing quality until it is at most
/// `max_bytes`, and write it next to the original.
pub async fn compress_image(path: &Path, max_bytes: u64) -> Result<PathBuf> {
    let source = path.to_path_buf();
    tokio::task::spawn_blocking(move || compress_blocking(&source, max_bytes))
        .await
        .context("Image compression task failed")?
}

fn compress_blocking(path: &Path, max_bytes: u64) -> Result<PathBuf> {
    let decoded = image::open(path)
        .with_context(|| format!("Failed to decode image: {}", path.display()))?;
    // JPEG has no alpha channel.
    let rgb = decoded.to_rgb8();

    let mut smallest = 0;
    for quality in QUALITIES {
        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, quality)
            .encode_image(&rgb)
            .with_context(|| format!("Failed to encode JPEG at quality {}", quality))?;
        debug!(
            "Recompressed {} at quality {}: {} bytes",
            path.display(),
            quality,
            encoded.len()
        );
        smallest = encoded.len();
        if encoded.len() as u64 <= max_bytes {
            let out = compressed_path(path);
            std::fs::write(&out, &encoded)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            return Ok(out);
        }
    }

    anyhow::bail!(
        "Image {} is still {} bytes at the lowest quality (limit {})",
        path.display(),
        smallest,
        max_bytes
    )
}
