use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use ndarray::Array4;
use rayon::prelude::*;

use crate::types::Frame;

/// Square input edge shared by the YOLOv2 family.
pub const INPUT_SIZE: u32 = 416;

/// Stretch the frame to `target_size`² and lay it out as a `[1, 3, H, W]` RGB
/// tensor. Each channel value is `byte * pixel_scale`.
pub fn frame_to_nchw(frame: &Frame, target_size: u32, pixel_scale: f32) -> Result<Array4<f32>> {
    let expected_len = frame.expected_len();
    if frame.width == 0 || frame.height == 0 || frame.rgba.len() != expected_len {
        return Err(anyhow!(
            "malformed frame {}x{}: got {} bytes, expected {}",
            frame.width,
            frame.height,
            frame.rgba.len(),
            expected_len
        ));
    }

    let resized = if frame.width == target_size && frame.height == target_size {
        frame.rgba.clone()
    } else {
        let src_image = fir::images::Image::from_vec_u8(
            frame.width,
            frame.height,
            frame.rgba.clone(),
            fir::PixelType::U8x4,
        )?;
        let mut dst_image = fir::images::Image::new(target_size, target_size, fir::PixelType::U8x4);
        let mut resizer = fir::Resizer::new();
        let resize_options = fir::ResizeOptions::new()
            .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
        resizer
            .resize(&src_image, &mut dst_image, Some(&resize_options))
            .context("fast resize failed")?;
        dst_image.into_vec()
    };

    let plane = (target_size as usize) * (target_size as usize);
    let mut data = vec![0.0f32; plane * 3];
    let (red, rest) = data.split_at_mut(plane);
    let (green, blue) = rest.split_at_mut(plane);
    red.par_iter_mut()
        .zip(green.par_iter_mut())
        .zip(blue.par_iter_mut())
        .zip(resized.par_chunks_exact(4))
        .for_each(|(((r, g), b), px)| {
            *r = px[0] as f32 * pixel_scale;
            *g = px[1] as f32 * pixel_scale;
            *b = px[2] as f32 * pixel_scale;
        });

    Array4::<f32>::from_shape_vec(
        (1, 3, target_size as usize, target_size as usize),
        data,
    )
    .map_err(|err| anyhow!("failed to build input tensor: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Frame {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        Frame::new(data, width, height, 0)
    }

    #[test]
    fn splits_channels_into_planes() {
        let frame = solid(8, 8, [255, 128, 0, 255]);
        let tensor = frame_to_nchw(&frame, 8, 1.0 / 255.0).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 8, 8]);
        assert!((tensor[[0, 0, 3, 3]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 3, 3]] - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 2, 3, 3]], 0.0);
    }

    #[test]
    fn resizes_to_model_input() {
        let frame = solid(64, 48, [10, 20, 30, 255]);
        let tensor = frame_to_nchw(&frame, INPUT_SIZE, 1.0).unwrap();
        assert_eq!(
            tensor.shape(),
            &[1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize]
        );
        assert!((tensor[[0, 2, 200, 200]] - 30.0).abs() <= 1.0);
    }

    #[test]
    fn rejects_truncated_buffers() {
        let mut frame = solid(4, 4, [0, 0, 0, 255]);
        frame.rgba.truncate(10);
        assert!(frame_to_nchw(&frame, INPUT_SIZE, 1.0).is_err());
    }
}
