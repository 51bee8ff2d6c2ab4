use std::convert::TryFrom;

use anyhow::{Result, anyhow};
use rayon::prelude::*;
use yuv::{
    YuvBiPlanarImage, YuvConversionMode, YuvPackedImage, YuvRange, YuvStandardMatrix,
    yuv_nv12_to_rgba, yuyv422_to_rgba,
};
use zune_jpeg::{
    JpegDecoder,
    zune_core::{bytestream::ZCursor, colorspace::ColorSpace, options::DecoderOptions},
};

/// Device-native pixel layouts a camera may hand us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceFormat {
    Nv12,
    Yuyv,
    Mjpeg,
    Rgb,
    Bgr,
    Gray,
}

#[derive(Debug)]
pub struct RgbaFrame {
    pub rgba: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

pub fn convert(format: SourceFormat, data: &[u8], width: u32, height: u32) -> Result<RgbaFrame> {
    let rgba = match format {
        SourceFormat::Mjpeg => return mjpeg_to_rgba(data),
        SourceFormat::Nv12 => nv12_to_rgba(data, width, height)?,
        SourceFormat::Yuyv => yuyv_to_rgba(data, width, height)?,
        SourceFormat::Rgb => rgb_like_to_rgba(data, width, height, false)?,
        SourceFormat::Bgr => rgb_like_to_rgba(data, width, height, true)?,
        SourceFormat::Gray => gray_to_rgba(data, width, height)?,
    };

    Ok(RgbaFrame {
        rgba,
        width,
        height,
    })
}

#[cfg(feature = "camera-nokhwa")]
pub fn convert_camera_frame(frame: &nokhwa::Buffer) -> Result<RgbaFrame> {
    use nokhwa::utils::FrameFormat;

    let resolution = frame.resolution();
    let format = match frame.source_frame_format() {
        FrameFormat::NV12 => SourceFormat::Nv12,
        FrameFormat::YUYV => SourceFormat::Yuyv,
        FrameFormat::MJPEG => SourceFormat::Mjpeg,
        FrameFormat::RAWRGB => SourceFormat::Rgb,
        FrameFormat::RAWBGR => SourceFormat::Bgr,
        FrameFormat::GRAY => SourceFormat::Gray,
    };
    convert(
        format,
        frame.buffer(),
        resolution.width_x,
        resolution.height_y,
    )
}

fn pixel_count(width: u32, height: u32) -> usize {
    width as usize * height as usize
}

fn ensure_len(format: &str, data: &[u8], expected: usize) -> Result<()> {
    if data.len() < expected {
        return Err(anyhow!(
            "{format} buffer too small: got {}, expected {expected}",
            data.len()
        ));
    }
    Ok(())
}

fn nv12_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let luma = pixel_count(width, height);
    let chroma = luma / 2;
    ensure_len("NV12", data, luma + chroma)?;

    let mut rgba = vec![0u8; luma * 4];
    let (y_plane, uv_plane) = data.split_at(luma);
    let image = YuvBiPlanarImage {
        y_plane,
        y_stride: width,
        uv_plane: &uv_plane[..chroma],
        uv_stride: width,
        width,
        height,
    };
    yuv_nv12_to_rgba(
        &image,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
        YuvConversionMode::Balanced,
    )
    .map_err(|err| anyhow!("NV12 conversion failed: {err:?}"))?;
    Ok(rgba)
}

fn yuyv_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    ensure_len("YUYV", data, pixel_count(width, height) * 2)?;

    let mut rgba = vec![0u8; pixel_count(width, height) * 4];
    let packed = YuvPackedImage {
        yuy: data,
        yuy_stride: width * 2,
        width,
        height,
    };
    yuyv422_to_rgba(
        &packed,
        &mut rgba,
        width * 4,
        YuvRange::Full,
        YuvStandardMatrix::Bt709,
    )
    .map_err(|err| anyhow!("YUYV conversion failed: {err:?}"))?;
    Ok(rgba)
}

/// Expand packed `bytes_per_pixel` samples to opaque RGBA, one pixel at a time.
fn expand_packed<F>(
    format: &str,
    data: &[u8],
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
    to_rgb: F,
) -> Result<Vec<u8>>
where
    F: Fn(&[u8]) -> [u8; 3] + Sync,
{
    let pixels = pixel_count(width, height);
    ensure_len(format, data, pixels * bytes_per_pixel)?;

    let mut rgba = vec![0u8; pixels * 4];
    rgba.par_chunks_mut(4)
        .zip(data.par_chunks_exact(bytes_per_pixel))
        .for_each(|(dst, src)| {
            dst[..3].copy_from_slice(&to_rgb(src));
            dst[3] = 255;
        });
    Ok(rgba)
}

fn rgb_like_to_rgba(data: &[u8], width: u32, height: u32, swap_rb: bool) -> Result<Vec<u8>> {
    if swap_rb {
        expand_packed("BGR", data, width, height, 3, |px| [px[2], px[1], px[0]])
    } else {
        expand_packed("RGB", data, width, height, 3, |px| [px[0], px[1], px[2]])
    }
}

fn gray_to_rgba(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    expand_packed("GRAY", data, width, height, 1, |px| [px[0]; 3])
}

fn mjpeg_to_rgba(data: &[u8]) -> Result<RgbaFrame> {
    let options = DecoderOptions::default().jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(ZCursor::new(data), options);
    let rgba = decoder
        .decode()
        .map_err(|err| anyhow!("MJPEG decode failed: {err:?}"))?;

    let info = decoder
        .info()
        .ok_or_else(|| anyhow!("MJPEG decoder reported no image info"))?;
    let width = u32::try_from(info.width).map_err(|_| anyhow!("MJPEG width out of range"))?;
    let height = u32::try_from(info.height).map_err(|_| anyhow!("MJPEG height out of range"))?;
    let expected_len = usize::try_from(width)
        .and_then(|w| usize::try_from(height).map(|h| w * h * 4))
        .map_err(|_| anyhow!("MJPEG dimensions do not fit usize"))?;
    ensure_len("decoded MJPEG", &rgba, expected_len)?;

    Ok(RgbaFrame {
        rgba,
        width,
        height,
    })
}
