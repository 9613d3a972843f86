//! Built-in lossless rgb encoder: raw pixels through the chunk
//! compressor. Always present, always the fallback of last resort.

use std::collections::BTreeMap;

use codec::{MapKey, Value};
use proto::Compressor;

use super::image::{ImageBuffer, PixelFormat};
use super::{EncodeError, EncodedFrame, EncodeOptions, Encoder, EncoderDescriptor};
use crate::model::Rect;

pub const RGB_ENCODING: &str = "rgb";

pub struct RgbEncoder {
    descriptor: EncoderDescriptor,
}

impl RgbEncoder {
    pub fn new() -> RgbEncoder {
        RgbEncoder {
            descriptor: EncoderDescriptor {
                encoding: RGB_ENCODING.to_owned(),
                inputs: vec![PixelFormat::Bgrx, PixelFormat::Bgra, PixelFormat::Rgb],
                alpha: true,
                lossless: true,
                video: false,
                scroll_supported: true,
                delta_supported: true,
                max_dims: (16384, 16384),
                size_efficiency: 100,
            },
        }
    }
}

impl Default for RgbEncoder {
    fn default() -> Self {
        RgbEncoder::new()
    }
}

impl Encoder for RgbEncoder {
    fn descriptor(&self) -> &EncoderDescriptor {
        &self.descriptor
    }

    fn self_test(&self) -> std::result::Result<(), EncodeError> {
        let img = ImageBuffer::new(
            2,
            2,
            PixelFormat::Bgrx,
            bytes::Bytes::from_static(&[0u8; 16]),
        )
        .map_err(|e| EncodeError::Permanent(e.to_string()))?;
        let frame = self.encode(&img, &img.bounds(), 100, 100, &EncodeOptions::default())?;
        if frame.lossy {
            return Err(EncodeError::Permanent("rgb must be lossless".into()));
        }
        Ok(())
    }

    fn encode(
        &self,
        image: &ImageBuffer,
        region: &Rect,
        _quality: u8,
        speed: u8,
        _options: &EncodeOptions,
    ) -> std::result::Result<EncodedFrame, EncodeError> {
        let raw = image
            .crop(region)
            .map_err(|e| EncodeError::Transient(e.to_string()))?;
        let rowstride = region.w * image.format.bytes_per_pixel() as u32;

        // High speed skips the compressor entirely.
        let compressor = if speed >= 90 {
            Compressor::None
        } else {
            Compressor::Lz4
        };
        let packed = compressor
            .compress(&raw)
            .map_err(|e| EncodeError::Transient(e.to_string()))?;
        let (data, used) = if packed.len() < raw.len() {
            (packed, compressor)
        } else {
            (raw, Compressor::None)
        };

        let mut client_options = BTreeMap::new();
        client_options.insert(
            MapKey::from("rgb_format"),
            Value::Str(image.format.as_str().to_owned()),
        );
        if used != Compressor::None {
            client_options.insert(
                MapKey::from("compress"),
                Value::Str(used.as_str().to_owned()),
            );
        }

        Ok(EncodedFrame {
            encoding: self.descriptor.encoding.clone(),
            data,
            rowstride,
            lossy: false,
            client_options,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn image(w: u32, h: u32) -> ImageBuffer {
        let pixels: Vec<u8> = (0..(w * h * 4)).map(|i| ((i / 64) % 251) as u8).collect();
        ImageBuffer::new(w, h, PixelFormat::Bgrx, Bytes::from(pixels)).unwrap()
    }

    #[test]
    fn test_self_test() {
        assert!(RgbEncoder::new().self_test().is_ok());
    }

    #[test]
    fn test_compressible_pixels_shrink() {
        let encoder = RgbEncoder::new();
        let img = image(64, 64);
        let frame = encoder
            .encode(&img, &img.bounds(), 100, 30, &EncodeOptions::default())
            .unwrap();
        assert!(!frame.lossy);
        assert!(frame.data.len() < 64 * 64 * 4);
        assert_eq!(
            frame.client_options[&MapKey::from("compress")],
            Value::Str("lz4".into())
        );
    }

    #[test]
    fn test_high_speed_skips_compression() {
        let encoder = RgbEncoder::new();
        let img = image(8, 8);
        let frame = encoder
            .encode(&img, &img.bounds(), 100, 95, &EncodeOptions::default())
            .unwrap();
        assert_eq!(frame.data.len(), 8 * 8 * 4);
        assert!(!frame.client_options.contains_key(&MapKey::from("compress")));
    }

    #[test]
    fn test_sub_region_rowstride() {
        let encoder = RgbEncoder::new();
        let img = image(64, 64);
        let frame = encoder
            .encode(
                &img,
                &Rect::new(8, 8, 16, 16),
                100,
                95,
                &EncodeOptions::default(),
            )
            .unwrap();
        assert_eq!(frame.rowstride, 16 * 4);
        assert_eq!(frame.data.len(), 16 * 16 * 4);
    }
}
