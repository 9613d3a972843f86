//! Encoder selection.
//!
//! On each batch-timer fire the scheduler scores the candidate encoders
//! for the consolidated region and picks one. Filters knock out encoders
//! that cannot take the job at all; the survivors are ranked by client
//! preference, then predicted bandwidth, then predicted encode cost.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::encode::image::PixelFormat;
use crate::encode::EncoderDescriptor;
use crate::model::ContentType;

/// Regions at or under this many pixels always go lossless; a lossy codec
/// cannot win anything on a cursor-sized blit.
pub const SMALL_REGION_PIXELS: u64 = 4096;

#[derive(Debug)]
pub struct SelectionInput<'a> {
    pub candidates: &'a [EncoderDescriptor],
    /// Negotiated encodings, client preference order.
    pub client_encodings: &'a [String],
    pub content_type: ContentType,
    pub region_area: u64,
    pub surface_area: u64,
    pub pixel_format: PixelFormat,
    pub needs_alpha: bool,
    pub quality: u8,
    pub min_quality: u8,
    pub lossless_required: bool,
    /// A video encoder was in use and the region still looks like video.
    pub video_sticky: Option<&'a str>,
    pub blacklist: &'a HashMap<String, Instant>,
    pub now: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub encoding: String,
    pub lossless: bool,
    pub video: bool,
}

fn usable(input: &SelectionInput<'_>, d: &EncoderDescriptor) -> bool {
    if !input.client_encodings.iter().any(|e| *e == d.encoding) {
        return false;
    }
    if let Some(until) = input.blacklist.get(&d.encoding) {
        if *until > input.now {
            return false;
        }
    }
    if !d.inputs.contains(&input.pixel_format) {
        return false;
    }
    if input.needs_alpha && !d.alpha {
        return false;
    }
    if input.lossless_required && !d.lossless {
        return false;
    }
    let (max_w, max_h) = d.max_dims;
    if input.region_area > max_w as u64 * max_h as u64 {
        return false;
    }
    true
}

/// Lower is better.
fn rank(input: &SelectionInput<'_>, d: &EncoderDescriptor) -> (usize, u64, u64) {
    let preference = input
        .client_encodings
        .iter()
        .position(|e| *e == d.encoding)
        .unwrap_or(usize::MAX);
    let predicted_bytes = input.region_area * d.size_efficiency as u64 / 100;
    // Raw still encoders are near-free; video and entropy coders cost more
    // per pixel, roughly in proportion to how hard they squeeze.
    let predicted_cost = input.region_area * (100 - d.size_efficiency.min(99)) as u64 / 100;
    (preference, predicted_bytes, predicted_cost)
}

pub fn choose(input: &SelectionInput<'_>) -> Option<Selection> {
    // Stickiness: once video, stay video while it still qualifies.
    if let Some(sticky) = input.video_sticky {
        if !input.lossless_required {
            if let Some(d) = input
                .candidates
                .iter()
                .find(|d| d.encoding == sticky && d.video)
            {
                if usable(input, d) {
                    return Some(Selection {
                        encoding: d.encoding.clone(),
                        lossless: false,
                        video: true,
                    });
                }
            }
        }
    }

    let survivors: Vec<&EncoderDescriptor> = input
        .candidates
        .iter()
        .filter(|d| usable(input, d))
        .collect();
    if survivors.is_empty() {
        return None;
    }

    let want_lossless = input.lossless_required
        || input.quality >= 100
        || input.content_type == ContentType::Text
        || input.region_area <= SMALL_REGION_PIXELS;

    // Video content on a large region prefers a video encoder when one
    // survived the filters.
    if input.content_type == ContentType::Video && !want_lossless {
        if let Some(d) = survivors
            .iter()
            .filter(|d| d.video)
            .min_by_key(|d| rank(input, d))
        {
            return Some(Selection {
                encoding: d.encoding.clone(),
                lossless: false,
                video: true,
            });
        }
    }

    let pool: Vec<&&EncoderDescriptor> = if want_lossless {
        let lossless: Vec<_> = survivors.iter().filter(|d| d.lossless).collect();
        if lossless.is_empty() {
            survivors.iter().collect()
        } else {
            lossless
        }
    } else {
        // Lossy preferred; lossless still wins if the client ranks it first.
        survivors.iter().filter(|d| !d.video).collect()
    };
    let pool = if pool.is_empty() {
        survivors.iter().collect::<Vec<_>>()
    } else {
        pool
    };

    let best = pool.into_iter().min_by_key(|d| rank(input, d))?;
    Some(Selection {
        encoding: best.encoding.clone(),
        lossless: best.lossless,
        video: best.video,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encode::rgb::RgbEncoder;
    use crate::encode::Encoder;

    fn descriptors() -> Vec<EncoderDescriptor> {
        let rgb = RgbEncoder::new().descriptor().clone();
        let png = EncoderDescriptor {
            encoding: "png".into(),
            inputs: vec![PixelFormat::Bgrx, PixelFormat::Bgra],
            alpha: true,
            lossless: true,
            video: false,
            scroll_supported: false,
            delta_supported: false,
            max_dims: (8192, 8192),
            size_efficiency: 40,
        };
        let jpeg = EncoderDescriptor {
            encoding: "jpeg".into(),
            inputs: vec![PixelFormat::Bgrx],
            alpha: false,
            lossless: false,
            video: false,
            scroll_supported: false,
            delta_supported: false,
            max_dims: (8192, 8192),
            size_efficiency: 8,
        };
        let vp8 = EncoderDescriptor {
            encoding: "vp8".into(),
            inputs: vec![PixelFormat::Bgrx],
            alpha: false,
            lossless: false,
            video: true,
            scroll_supported: false,
            delta_supported: false,
            max_dims: (4096, 4096),
            size_efficiency: 4,
        };
        vec![rgb, png, jpeg, vp8]
    }

    fn input<'a>(
        candidates: &'a [EncoderDescriptor],
        encodings: &'a [String],
        blacklist: &'a HashMap<String, Instant>,
    ) -> SelectionInput<'a> {
        SelectionInput {
            candidates,
            client_encodings: encodings,
            content_type: ContentType::Auto,
            region_area: 500_000,
            surface_area: 1_000_000,
            pixel_format: PixelFormat::Bgrx,
            needs_alpha: false,
            quality: 60,
            min_quality: 1,
            lossless_required: false,
            video_sticky: None,
            blacklist,
            now: Instant::now(),
        }
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_picture_content_picks_lossy() {
        let c = descriptors();
        let e = names(&["jpeg", "png", "rgb"]);
        let b = HashMap::new();
        let mut i = input(&c, &e, &b);
        i.content_type = ContentType::Picture;
        let sel = choose(&i).unwrap();
        assert_eq!(sel.encoding, "jpeg");
        assert!(!sel.lossless);
    }

    #[test]
    fn test_text_content_goes_lossless() {
        let c = descriptors();
        let e = names(&["jpeg", "png", "rgb"]);
        let b = HashMap::new();
        let mut i = input(&c, &e, &b);
        i.content_type = ContentType::Text;
        let sel = choose(&i).unwrap();
        assert!(sel.lossless);
        assert_eq!(sel.encoding, "png");
    }

    #[test]
    fn test_small_region_goes_lossless() {
        let c = descriptors();
        let e = names(&["jpeg", "rgb"]);
        let b = HashMap::new();
        let mut i = input(&c, &e, &b);
        i.region_area = 1024;
        assert!(choose(&i).unwrap().lossless);
    }

    #[test]
    fn test_alpha_filters_encoders() {
        let c = descriptors();
        let e = names(&["jpeg", "png"]);
        let b = HashMap::new();
        let mut i = input(&c, &e, &b);
        i.needs_alpha = true;
        i.pixel_format = PixelFormat::Bgra;
        assert_eq!(choose(&i).unwrap().encoding, "png");
    }

    #[test]
    fn test_video_content_picks_video_encoder() {
        let c = descriptors();
        let e = names(&["vp8", "jpeg"]);
        let b = HashMap::new();
        let mut i = input(&c, &e, &b);
        i.content_type = ContentType::Video;
        let sel = choose(&i).unwrap();
        assert_eq!(sel.encoding, "vp8");
        assert!(sel.video);
    }

    #[test]
    fn test_video_stickiness() {
        let c = descriptors();
        let e = names(&["jpeg", "vp8", "rgb"]);
        let b = HashMap::new();
        let mut i = input(&c, &e, &b);
        // Content no longer classified video, but the encoder is sticky.
        i.content_type = ContentType::Auto;
        i.video_sticky = Some("vp8");
        assert_eq!(choose(&i).unwrap().encoding, "vp8");
        // A lossless refresh breaks through the stickiness.
        i.lossless_required = true;
        assert_ne!(choose(&i).unwrap().encoding, "vp8");
    }

    #[test]
    fn test_blacklist_expires() {
        let c = descriptors();
        let e = names(&["jpeg", "rgb"]);
        let now = Instant::now();
        let mut b = HashMap::new();
        b.insert("jpeg".to_string(), now + std::time::Duration::from_secs(30));
        let mut i = input(&c, &e, &b);
        i.content_type = ContentType::Picture;
        i.now = now;
        assert_ne!(choose(&i).unwrap().encoding, "jpeg");
        // After expiry jpeg is back.
        i.now = now + std::time::Duration::from_secs(31);
        assert_eq!(choose(&i).unwrap().encoding, "jpeg");
    }

    #[test]
    fn test_no_common_encoding() {
        let c = descriptors();
        let e = names(&["h264"]);
        let b = HashMap::new();
        let i = input(&c, &e, &b);
        assert!(choose(&i).is_none());
    }

    #[test]
    fn test_quality_100_forces_lossless() {
        let c = descriptors();
        let e = names(&["jpeg", "png"]);
        let b = HashMap::new();
        let mut i = input(&c, &e, &b);
        i.quality = 100;
        assert!(choose(&i).unwrap().lossless);
    }
}
