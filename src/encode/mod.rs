//! Encoder dispatch.
//!
//! Picture codecs are external collaborators behind the [`Encoder`]
//! trait. At startup each registered adapter self-tests and publishes a
//! capability descriptor; at runtime the scheduler picks from the
//! descriptors and the session calls [`EncoderRegistry::encode`] on a
//! worker. Transient failures retry on the fallback still encoder,
//! permanent failures drop the adapter for the rest of the session.

pub mod image;
pub mod rgb;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use codec::{MapKey, Value};
use log::{info, warn};

use crate::error::{Error, Result};
use crate::model::{ContentType, Rect};
use crate::encode::image::{ImageBuffer, PixelFormat};

/// What an adapter can do; consulted by encoder selection.
#[derive(Debug, Clone)]
pub struct EncoderDescriptor {
    /// Wire encoding name (`rgb24`, `png`, `jpeg`, ...).
    pub encoding: String,
    pub inputs: Vec<PixelFormat>,
    pub alpha: bool,
    pub lossless: bool,
    /// Video encoders keep inter-frame state and bound in-flight frames
    /// harder.
    pub video: bool,
    pub scroll_supported: bool,
    pub delta_supported: bool,
    pub max_dims: (u32, u32),
    /// Expected output size as a percentage of raw input; above 100 the
    /// encoder may expand incompressible content.
    pub size_efficiency: u8,
}

#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    /// Force lossless output regardless of quality (auto-refresh).
    pub lossless: bool,
    pub content_type: ContentType,
}

#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub encoding: String,
    pub data: Bytes,
    pub rowstride: u32,
    /// Whether this output loses information; drives auto-refresh.
    pub lossy: bool,
    pub client_options: BTreeMap<MapKey, Value>,
}

#[derive(Debug)]
pub enum EncodeError {
    /// Retry the frame with the fallback encoder.
    Transient(String),
    /// Drop the adapter for the rest of the session.
    Permanent(String),
}

pub trait Encoder: Send + Sync {
    fn descriptor(&self) -> &EncoderDescriptor;

    /// Exercised once at registration; a failing adapter is never used.
    fn self_test(&self) -> std::result::Result<(), EncodeError> {
        Ok(())
    }

    fn encode(
        &self,
        image: &ImageBuffer,
        region: &Rect,
        quality: u8,
        speed: u8,
        options: &EncodeOptions,
    ) -> std::result::Result<EncodedFrame, EncodeError>;
}

/// The adapters available to one session.
#[derive(Default, Clone)]
pub struct EncoderRegistry {
    encoders: Vec<Arc<dyn Encoder>>,
}

impl EncoderRegistry {
    /// Registry with the built-in lossless rgb adapter, always available
    /// as the fallback of last resort.
    pub fn with_builtins() -> EncoderRegistry {
        let mut registry = EncoderRegistry::default();
        registry
            .register(Arc::new(rgb::RgbEncoder::new()))
            .expect("builtin rgb encoder must self-test");
        registry
    }

    pub fn register(&mut self, encoder: Arc<dyn Encoder>) -> Result<()> {
        let name = encoder.descriptor().encoding.clone();
        match encoder.self_test() {
            Ok(()) => {
                info!("registered encoder `{name}`");
                self.encoders.push(encoder);
                Ok(())
            }
            Err(EncodeError::Transient(reason)) | Err(EncodeError::Permanent(reason)) => {
                warn!("encoder `{name}` failed its self-test: {reason}");
                Err(Error::ErrEncoderPermanent { name, reason })
            }
        }
    }

    pub fn descriptors(&self) -> Vec<EncoderDescriptor> {
        self.encoders.iter().map(|e| e.descriptor().clone()).collect()
    }

    pub fn encodings(&self) -> Vec<String> {
        self.encoders
            .iter()
            .map(|e| e.descriptor().encoding.clone())
            .collect()
    }

    pub fn get(&self, encoding: &str) -> Option<Arc<dyn Encoder>> {
        self.encoders
            .iter()
            .find(|e| e.descriptor().encoding == encoding)
            .cloned()
    }

    /// Removes an adapter, e.g. after a permanent failure.
    pub fn unregister(&mut self, encoding: &str) {
        self.encoders.retain(|e| e.descriptor().encoding != encoding);
    }

    /// Encodes one frame, falling back to the built-in rgb adapter on a
    /// transient failure and dropping the adapter on a permanent one.
    pub fn encode(
        &mut self,
        encoding: &str,
        image: &ImageBuffer,
        region: &Rect,
        quality: u8,
        speed: u8,
        options: &EncodeOptions,
    ) -> Result<EncodedFrame> {
        let encoder = self.get(encoding).ok_or(Error::ErrNoEncoder)?;
        match encoder.encode(image, region, quality, speed, options) {
            Ok(frame) => Ok(frame),
            Err(EncodeError::Transient(reason)) => {
                warn!("encoder `{encoding}` transient failure: {reason}; retrying with rgb");
                let fallback = self
                    .get(rgb::RGB_ENCODING)
                    .filter(|f| f.descriptor().encoding != encoding)
                    .ok_or(Error::ErrEncoderTransient {
                        name: encoding.to_owned(),
                        reason,
                    })?;
                fallback
                    .encode(image, region, quality, speed, options)
                    .map_err(|e| match e {
                        EncodeError::Transient(reason) | EncodeError::Permanent(reason) => {
                            Error::ErrEncoderTransient {
                                name: rgb::RGB_ENCODING.to_owned(),
                                reason,
                            }
                        }
                    })
            }
            Err(EncodeError::Permanent(reason)) => {
                warn!("encoder `{encoding}` permanent failure: {reason}; dropping it");
                self.unregister(encoding);
                Err(Error::ErrEncoderPermanent {
                    name: encoding.to_owned(),
                    reason,
                })
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::mock::MockEncoder;
    use super::*;

    fn image() -> ImageBuffer {
        ImageBuffer::new(
            16,
            16,
            PixelFormat::Bgrx,
            Bytes::from(vec![0x55u8; 16 * 16 * 4]),
        )
        .unwrap()
    }

    #[test]
    fn test_builtin_registry() {
        let registry = EncoderRegistry::with_builtins();
        assert_eq!(registry.encodings(), vec![rgb::RGB_ENCODING.to_owned()]);
    }

    #[test]
    fn test_unknown_encoder() {
        let mut registry = EncoderRegistry::with_builtins();
        let img = image();
        assert!(matches!(
            registry.encode("webp", &img, &img.bounds(), 50, 50, &EncodeOptions::default()),
            Err(Error::ErrNoEncoder)
        ));
    }

    #[test]
    fn test_transient_falls_back_to_rgb() {
        let mut registry = EncoderRegistry::with_builtins();
        let mut failing = MockEncoder::lossy("jpeg");
        failing.fail = Some(|| EncodeError::Transient("encoder hiccup".into()));
        registry.register(Arc::new(failing)).unwrap();

        let img = image();
        let frame = registry
            .encode("jpeg", &img, &img.bounds(), 50, 50, &EncodeOptions::default())
            .unwrap();
        assert_eq!(frame.encoding, rgb::RGB_ENCODING);
        // The failing adapter stays registered.
        assert!(registry.get("jpeg").is_some());
    }

    #[test]
    fn test_permanent_drops_encoder() {
        let mut registry = EncoderRegistry::with_builtins();
        let mut failing = MockEncoder::lossy("jpeg");
        failing.fail = Some(|| EncodeError::Permanent("codec library crashed".into()));
        registry.register(Arc::new(failing)).unwrap();

        let img = image();
        assert!(registry
            .encode("jpeg", &img, &img.bounds(), 50, 50, &EncodeOptions::default())
            .is_err());
        assert!(registry.get("jpeg").is_none());
    }
}
