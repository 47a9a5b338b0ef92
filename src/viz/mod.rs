//! Kernel visualization: weight tensors to inlineable grayscale images.
//!
//! Mirrors what the client expects: each 2-D kernel slice becomes a 64x64
//! nearest-neighbor PNG, base64-encoded as a `data:` URI, ordered along the
//! tensor's leading (output-channel) axis.

use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use burn::tensor::TensorData;
use image::{imageops::FilterType, DynamicImage, GrayImage, ImageFormat, Luma};
use tracing::warn;

/// Side length of the rendered kernel tiles.
pub const KERNEL_TILE: u32 = 64;

/// Slices with a value range below this are left unrescaled to avoid
/// dividing by a near-zero range on near-constant kernels.
pub const NORM_EPSILON: f32 = 1e-6;

/// Render a weight tensor as a sequence of image blobs.
///
/// Rank 4 `[out, in, h, w]` selects input channel 0 for every output
/// channel; rank 3 `[n, h, w]` is used directly. Any other rank yields an
/// empty sequence with a warning — visualization is best-effort and must
/// never fail the run.
pub fn render_kernels(data: &TensorData) -> Vec<String> {
    let shape = data.shape.clone();
    let values: Vec<f32> = match data.to_vec::<f32>() {
        Ok(values) => values,
        Err(err) => {
            warn!(error = ?err, "Kernel tensor is not f32-convertible; skipping visualization");
            return Vec::new();
        }
    };

    let (count, height, width, slice_stride, item_stride) = match shape.as_slice() {
        // Visualize only the first input channel of each filter.
        [out, input, h, w] => (*out, *h, *w, *h * *w, *input * *h * *w),
        [n, h, w] => (*n, *h, *w, *h * *w, *h * *w),
        other => {
            warn!(
                shape = ?other,
                "Unsupported kernel tensor rank for visualization; returning no images"
            );
            return Vec::new();
        }
    };

    let mut images = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * item_stride;
        let slice = &values[start..start + slice_stride];
        match render_slice(slice, height, width) {
            Some(uri) => images.push(uri),
            None => warn!(index, "Failed to encode kernel slice"),
        }
    }
    images
}

/// Rescale one 2-D slice to 8-bit and encode it as a 64x64 PNG data URI.
fn render_slice(slice: &[f32], height: usize, width: usize) -> Option<String> {
    let min = slice.iter().copied().fold(f32::INFINITY, f32::min);
    let max = slice.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let rescale = max - min > NORM_EPSILON;
    let mut img = GrayImage::new(width as u32, height as u32);
    for y in 0..height {
        for x in 0..width {
            let value = slice[y * width + x];
            let normalized = if rescale { (value - min) / (max - min) } else { value };
            let byte = (normalized * 255.0).clamp(0.0, 255.0) as u8;
            img.put_pixel(x as u32, y as u32, Luma([byte]));
        }
    }

    let resized = DynamicImage::ImageLuma8(img)
        .resize_exact(KERNEL_TILE, KERNEL_TILE, FilterType::Nearest)
        .to_luma8();

    let mut buffer = Vec::new();
    DynamicImage::ImageLuma8(resized)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .ok()?;

    Some(format!("data:image/png;base64,{}", BASE64.encode(&buffer)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(uri: &str) -> image::DynamicImage {
        let payload = uri.strip_prefix("data:image/png;base64,").unwrap();
        let bytes = BASE64.decode(payload).unwrap();
        image::load_from_memory(&bytes).unwrap()
    }

    #[test]
    fn test_rank4_weight_renders_one_image_per_filter() {
        // 4 output channels, 1 input channel, 3x3 kernels.
        let values: Vec<f32> = (0..4 * 9).map(|v| v as f32 / 10.0).collect();
        let data = TensorData::new(values, [4, 1, 3, 3]);

        let images = render_kernels(&data);
        assert_eq!(images.len(), 4);
        for uri in &images {
            let img = decode(uri);
            assert_eq!(img.width(), 64);
            assert_eq!(img.height(), 64);
        }
    }

    #[test]
    fn test_rank4_multi_input_channel_uses_channel_zero() {
        // Two filters over three input channels; channel 0 of filter 1 is
        // all ones, so its tile must not be black.
        let mut values = vec![0.0f32; 2 * 3 * 2 * 2];
        for v in values.iter_mut().take(4) {
            *v = 1.0;
        }
        let data = TensorData::new(values, [2, 3, 2, 2]);
        let images = render_kernels(&data);
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn test_rank3_tensor_is_used_directly() {
        let values: Vec<f32> = (0..3 * 25).map(|v| (v % 7) as f32).collect();
        let data = TensorData::new(values, [3, 5, 5]);
        assert_eq!(render_kernels(&data).len(), 3);
    }

    #[test]
    fn test_rank2_yields_empty_sequence() {
        let data = TensorData::new(vec![1.0f32; 16], [4, 4]);
        assert!(render_kernels(&data).is_empty());
    }

    #[test]
    fn test_constant_slice_skips_rescaling() {
        // A constant slice would divide by ~0 when rescaled; it must still
        // produce a valid image.
        let data = TensorData::new(vec![0.5f32; 9], [1, 3, 3]);
        let images = render_kernels(&data);
        assert_eq!(images.len(), 1);
        let img = decode(&images[0]).to_luma8();
        // Raw 0.5 scales to 127.
        assert_eq!(img.get_pixel(0, 0).0[0], 127);
    }
}
