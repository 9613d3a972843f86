//! Damage scheduler.
//!
//! One [`DamageState`] exists per surface and per attached client. It is a
//! plain state machine driven by the session actor: damage intake arms a
//! batch timer, the timer fire plans an emission (scroll, delta, skip or a
//! full encode job), encode completion assigns the wire sequence, and the
//! client's ack feeds the batch-delay control loop.
//!
//! ```text
//! idle --damage--> batching --timer--> encoding --done--> awaiting-ack
//!   ^                  ^  \--defer--^      |                  |
//!   |                  +--------(pending)--+------ack---------+
//!   +--------------------------(quiescent)------ack-----------+
//! ```

pub mod batch;
pub mod delta;
pub mod scroll;
pub mod select;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::time::Instant;

use crate::encode::image::{fnv1a, ImageBuffer, PixelFormat};
use crate::encode::EncoderDescriptor;
use crate::model::{ContentType, Rect, Region, Wid};
use crate::damage::batch::{AckSample, BatchConfig, BatchDelay};
use crate::damage::delta::DeltaCache;
use crate::damage::scroll::{ScrollBand, ScrollDetector};
use crate::damage::select::{Selection, SelectionInput};

#[derive(Debug, Clone)]
pub struct DamageConfig {
    pub batch: BatchConfig,
    pub auto_refresh_delay: Duration,
    pub inflight_cap_video: usize,
    pub inflight_cap_still: usize,
    /// Pending damage covering this percentage of the surface collapses
    /// to a full-surface region.
    pub full_frame_percent: u64,
    pub encoder_error_blacklist: Duration,
    /// Video stickiness drops below this update rate...
    pub video_min_updates: u32,
    /// ...sustained over this window.
    pub video_window: Duration,
}

impl Default for DamageConfig {
    fn default() -> Self {
        DamageConfig {
            batch: BatchConfig::default(),
            auto_refresh_delay: Duration::from_millis(150),
            inflight_cap_video: 3,
            inflight_cap_still: 10,
            full_frame_percent: 75,
            encoder_error_blacklist: Duration::from_secs(30),
            video_min_updates: 2,
            video_window: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    Idle,
    Batching,
    Encoding,
    AwaitingAck,
    Dead,
}

/// Timer (re)arm requests returned to the session actor; the generation
/// makes stale fires harmless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ArmBatchTimer { generation: u64, delay: Duration },
    ArmRefreshTimer { generation: u64, delay: Duration },
}

/// Work handed to an encoder worker.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub wid: Wid,
    pub region: Rect,
    pub encoding: String,
    pub quality: u8,
    pub speed: u8,
    pub lossless: bool,
    pub content_type: ContentType,
}

/// What the timer fire decided to emit.
#[derive(Debug)]
pub enum Plan {
    /// The frame was already transmitted; nothing to send.
    Skip,
    Scroll {
        sequence: u64,
        bands: Vec<ScrollBand>,
    },
    /// XOR against a frame the client still holds.
    Delta {
        sequence: u64,
        region: Rect,
        data: Bytes,
        rowstride: u32,
        reference: u64,
        store: u64,
    },
    Encode(EncodeJob),
}

#[derive(Debug)]
pub enum FireOutcome {
    /// Not ready (stale generation, wrong state, cap or backpressure);
    /// any re-arm is in the actions.
    Deferred(Vec<Action>),
    Plan(Plan, Vec<Action>),
}

#[derive(Debug)]
struct InflightFrame {
    sequence: u64,
    encoding: String,
    lossy: bool,
    sent_at: Instant,
    bytes: usize,
}

pub struct DamageState {
    wid: Wid,
    bounds: Rect,
    pixel_format: PixelFormat,
    alpha: bool,
    config: DamageConfig,
    candidates: Vec<EncoderDescriptor>,
    client_encodings: Vec<String>,

    state: SurfaceState,
    pending: Region,
    next_sequence: u64,
    inflight: VecDeque<InflightFrame>,
    batch: BatchDelay,
    batch_generation: u64,
    refresh_generation: u64,
    /// Lossy-painted area not yet refreshed losslessly.
    refresh_region: Region,
    force_lossless: bool,

    quality: u8,
    min_quality: u8,
    speed: u8,
    min_speed: u8,
    content_type: ContentType,
    bandwidth_limit_bps: u64,

    blacklist: HashMap<String, Instant>,
    video_encoding: Option<String>,
    recent_damage: VecDeque<Instant>,
    sent_bytes: VecDeque<(Instant, usize)>,

    scroll: ScrollDetector,
    delta: DeltaCache,
}

/// Quality nudges below 5 points and speed nudges below 10 are noise from
/// the control loop's perspective and are ignored.
pub const QUALITY_EDGE: u8 = 5;
pub const SPEED_EDGE: u8 = 10;

impl DamageState {
    pub fn new(
        wid: Wid,
        bounds: Rect,
        pixel_format: PixelFormat,
        alpha: bool,
        candidates: Vec<EncoderDescriptor>,
        client_encodings: Vec<String>,
        config: DamageConfig,
    ) -> DamageState {
        DamageState {
            wid,
            bounds,
            pixel_format,
            alpha,
            batch: BatchDelay::new(config.batch.clone()),
            config,
            candidates,
            client_encodings,
            state: SurfaceState::Idle,
            pending: Region::new(),
            next_sequence: 1,
            inflight: VecDeque::new(),
            batch_generation: 0,
            refresh_generation: 0,
            refresh_region: Region::new(),
            force_lossless: false,
            quality: 80,
            min_quality: 1,
            speed: 50,
            min_speed: 1,
            content_type: ContentType::Auto,
            bandwidth_limit_bps: 0,
            blacklist: HashMap::new(),
            video_encoding: None,
            recent_damage: VecDeque::new(),
            sent_bytes: VecDeque::new(),
            scroll: ScrollDetector::new(),
            delta: DeltaCache::new(),
        }
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn wid(&self) -> Wid {
        self.wid
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn batch_delay_ms(&self) -> u64 {
        self.batch.delay_ms()
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn set_content_type(&mut self, content_type: ContentType) {
        self.content_type = content_type;
    }

    pub fn set_bandwidth_limit(&mut self, bps: u64) {
        self.bandwidth_limit_bps = bps;
    }

    pub fn set_candidates(&mut self, candidates: Vec<EncoderDescriptor>) {
        self.candidates = candidates;
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    pub fn speed(&self) -> u8 {
        self.speed
    }

    pub fn set_quality(&mut self, quality: u8) {
        let quality = quality.clamp(1, 100).max(self.min_quality);
        if quality.abs_diff(self.quality) >= QUALITY_EDGE || quality == 100 || quality == 1 {
            self.quality = quality;
        }
    }

    pub fn set_speed(&mut self, speed: u8) {
        let speed = speed.clamp(1, 100).max(self.min_speed);
        if speed.abs_diff(self.speed) >= SPEED_EDGE || speed == 100 || speed == 1 {
            self.speed = speed;
        }
    }

    pub fn set_min_quality(&mut self, min_quality: u8) {
        self.min_quality = min_quality.clamp(1, 100);
        self.quality = self.quality.max(self.min_quality);
    }

    pub fn set_min_speed(&mut self, min_speed: u8) {
        self.min_speed = min_speed.clamp(1, 100);
        self.speed = self.speed.max(self.min_speed);
    }

    fn inflight_cap(&self) -> usize {
        if self.video_encoding.is_some() {
            self.config.inflight_cap_video
        } else {
            self.config.inflight_cap_still
        }
    }

    fn arm_batch(&mut self, now: Instant) -> Action {
        self.batch_generation += 1;
        Action::ArmBatchTimer {
            generation: self.batch_generation,
            delay: self.batch.delay(now),
        }
    }

    fn bandwidth_used_bps(&mut self, now: Instant) -> u64 {
        while let Some((t, _)) = self.sent_bytes.front() {
            if now.saturating_duration_since(*t) > Duration::from_secs(1) {
                self.sent_bytes.pop_front();
            } else {
                break;
            }
        }
        self.sent_bytes.iter().map(|(_, b)| *b as u64).sum::<u64>() * 8
    }

    fn update_video_stickiness(&mut self, now: Instant) {
        if self.video_encoding.is_none() {
            return;
        }
        let window = self.config.video_window;
        let updates = self
            .recent_damage
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= window)
            .count() as u32;
        let needed = self.config.video_min_updates * window.as_secs() as u32;
        if updates < needed {
            debug!("window {}: video stickiness dropped", self.wid);
            self.video_encoding = None;
        }
    }

    /// New dirty rectangle from the backend (or a client refresh request).
    pub fn damage(&mut self, rect: Rect, now: Instant) -> Vec<Action> {
        if self.state == SurfaceState::Dead {
            return vec![];
        }
        // An empty or fully off-surface rectangle is a no-op.
        let Some(clipped) = rect.intersection(&self.bounds) else {
            return vec![];
        };
        self.pending.add(clipped);
        // Any new damage cancels a pending auto-refresh.
        self.refresh_generation += 1;

        if self.pending.area() * 100 >= self.bounds.area() * self.config.full_frame_percent {
            self.pending.collapse_to(self.bounds);
        }
        self.recent_damage.push_back(now);
        while self.recent_damage.len() > 128 {
            self.recent_damage.pop_front();
        }

        match self.state {
            SurfaceState::Idle | SurfaceState::AwaitingAck => {
                self.state = SurfaceState::Batching;
                vec![self.arm_batch(now)]
            }
            SurfaceState::Batching => vec![self.arm_batch(now)],
            // Accumulates; the post-encode ack transition re-arms.
            SurfaceState::Encoding => vec![],
            SurfaceState::Dead => unreachable!(),
        }
    }

    /// Surface geometry changed; pending damage is re-clipped.
    pub fn resize(&mut self, bounds: Rect) {
        self.bounds = bounds;
        self.pending.clip(&bounds);
        self.refresh_region.clip(&bounds);
        self.scroll.reset();
        self.delta.clear();
    }

    /// Whether a batch-timer fire with this generation is still current;
    /// lets the caller skip the surface capture for stale fires.
    pub fn wants_fire(&self, generation: u64) -> bool {
        generation == self.batch_generation && self.state == SurfaceState::Batching
    }

    /// Batch timer fired: plan what to emit. `image` is the current
    /// surface capture, looked up by the caller after checking
    /// [`DamageState::wants_fire`].
    pub fn timer_fired(
        &mut self,
        generation: u64,
        image: &ImageBuffer,
        now: Instant,
        backpressure: bool,
    ) -> FireOutcome {
        if generation != self.batch_generation || self.state != SurfaceState::Batching {
            return FireOutcome::Deferred(vec![]);
        }
        if backpressure || self.inflight.len() >= self.inflight_cap() {
            // Defer instead of emitting; the pending region keeps
            // coalescing new damage in the meantime.
            trace!(
                "window {}: deferring fire (backpressure={backpressure}, inflight={})",
                self.wid,
                self.inflight.len()
            );
            self.batch_generation += 1;
            let delay = self.batch.delay(now).max(Duration::from_millis(10));
            return FireOutcome::Deferred(vec![Action::ArmBatchTimer {
                generation: self.batch_generation,
                delay,
            }]);
        }

        self.update_video_stickiness(now);
        let rects = self.pending.coalesced();
        let region = match rects.iter().copied().reduce(|a, b| a.union(&b)) {
            Some(r) => r,
            None => {
                self.state = SurfaceState::Idle;
                return FireOutcome::Deferred(vec![]);
            }
        };
        self.pending.clear();

        let full_frame = region == self.bounds;
        let lossless_required = self.force_lossless;
        self.force_lossless = false;

        // Identical frame: nothing to transmit, but the fingerprint cache
        // and the video heuristic both want to know.
        if full_frame {
            if let Ok(pixels) = image.crop(&region) {
                let hash = fnv1a(&pixels);
                if self.delta.contains(hash) {
                    trace!("window {}: unchanged frame, skipping", self.wid);
                    self.video_encoding = None;
                    self.state = if self.inflight.is_empty() {
                        SurfaceState::Idle
                    } else {
                        SurfaceState::AwaitingAck
                    };
                    return FireOutcome::Plan(Plan::Skip, vec![]);
                }
            }

            // Scroll beats any pixel encoder when it applies.
            if !lossless_required && self.bounds == image.bounds() {
                if let Some(bands) = self.scroll.detect(image) {
                    let sequence = self.next_sequence;
                    self.next_sequence += 1;
                    self.scroll.update(image);
                    self.inflight.push_back(InflightFrame {
                        sequence,
                        encoding: "scroll".into(),
                        lossy: false,
                        sent_at: now,
                        bytes: bands.len() * 12,
                    });
                    // Rows the translation did not cover stay dirty.
                    let mut actions = vec![];
                    for gap in scroll_gaps(&bands, self.bounds) {
                        self.pending.add(gap);
                    }
                    self.state = if self.pending.is_empty() {
                        SurfaceState::AwaitingAck
                    } else {
                        SurfaceState::Batching
                    };
                    if self.state == SurfaceState::Batching {
                        actions.push(self.arm_batch(now));
                    }
                    return FireOutcome::Plan(Plan::Scroll { sequence, bands }, actions);
                }

                // Delta against a frame the client still holds.
                if let Ok(pixels) = image.crop(&region) {
                    if let Some(d) = self.delta.best_delta(&pixels) {
                        let sequence = self.next_sequence;
                        self.next_sequence += 1;
                        self.delta.insert(pixels);
                        self.scroll.update(image);
                        self.inflight.push_back(InflightFrame {
                            sequence,
                            encoding: "delta".into(),
                            lossy: false,
                            sent_at: now,
                            bytes: d.xor.len() / 8,
                        });
                        self.state = SurfaceState::AwaitingAck;
                        return FireOutcome::Plan(
                            Plan::Delta {
                                sequence,
                                region,
                                rowstride: region.w * self.pixel_format.bytes_per_pixel() as u32,
                                data: d.xor,
                                reference: d.reference,
                                store: d.store,
                            },
                            vec![],
                        );
                    }
                }
            }
        }

        let selection = match self.select_encoder(region, lossless_required, now) {
            Some(s) => s,
            None => {
                // Keep the damage; a blacklist expiry may unblock it.
                warn!("window {}: no usable encoder, deferring", self.wid);
                self.pending.add(region);
                self.force_lossless = lossless_required;
                self.batch_generation += 1;
                return FireOutcome::Deferred(vec![Action::ArmBatchTimer {
                    generation: self.batch_generation,
                    delay: Duration::from_millis(100),
                }]);
            }
        };
        if selection.video {
            self.video_encoding = Some(selection.encoding.clone());
        }
        self.state = SurfaceState::Encoding;
        FireOutcome::Plan(
            Plan::Encode(EncodeJob {
                wid: self.wid,
                region,
                encoding: selection.encoding,
                quality: self.quality,
                speed: self.speed,
                lossless: selection.lossless || lossless_required,
                content_type: self.content_type,
            }),
            vec![],
        )
    }

    fn select_encoder(
        &self,
        region: Rect,
        lossless_required: bool,
        now: Instant,
    ) -> Option<Selection> {
        select::choose(&SelectionInput {
            candidates: &self.candidates,
            client_encodings: &self.client_encodings,
            content_type: self.content_type,
            region_area: region.area(),
            surface_area: self.bounds.area(),
            pixel_format: self.pixel_format,
            needs_alpha: self.alpha,
            quality: self.quality,
            min_quality: self.min_quality,
            lossless_required,
            video_sticky: self.video_encoding.as_deref(),
            blacklist: &self.blacklist,
            now,
        })
    }

    /// An encoder worker finished `job`; assigns the wire sequence and
    /// arms the auto-refresh timer for lossy output.
    pub fn encode_complete(
        &mut self,
        job: &EncodeJob,
        image: &ImageBuffer,
        encoded_bytes: usize,
        lossy: bool,
        now: Instant,
    ) -> (u64, Vec<Action>) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.inflight.push_back(InflightFrame {
            sequence,
            encoding: job.encoding.clone(),
            lossy,
            sent_at: now,
            bytes: encoded_bytes,
        });
        self.sent_bytes.push_back((now, encoded_bytes));

        if job.region == self.bounds {
            self.scroll.update(image);
            if let Ok(pixels) = image.crop(&job.region) {
                self.delta.insert(pixels);
            }
        }

        let mut actions = vec![];
        if lossy {
            self.refresh_region.add(job.region);
            self.refresh_generation += 1;
            actions.push(Action::ArmRefreshTimer {
                generation: self.refresh_generation,
                delay: self.config.auto_refresh_delay,
            });
        } else if let Some(stale) = self.refresh_region.bounds() {
            if job.region.contains_rect(&stale) {
                // A lossless frame covering the stale area settles the debt.
                self.refresh_region.clear();
                self.refresh_generation += 1;
            }
        }

        if self.state == SurfaceState::Encoding {
            self.state = SurfaceState::AwaitingAck;
        }
        (sequence, actions)
    }

    /// The encode failed outright (fallback included); the damage flows
    /// back into the pending region.
    pub fn encode_failed(&mut self, job: &EncodeJob, now: Instant) -> Vec<Action> {
        if self.state == SurfaceState::Dead {
            return vec![];
        }
        self.pending.add_clipped(job.region, &self.bounds);
        self.state = SurfaceState::Batching;
        vec![self.arm_batch(now)]
    }

    /// `damage-sequence` from the client.
    pub fn ack(
        &mut self,
        sequence: u64,
        decode_time_us: i64,
        message: &str,
        now: Instant,
        backpressure: bool,
    ) -> Vec<Action> {
        if self.state == SurfaceState::Dead {
            return vec![];
        }
        let Some(pos) = self.inflight.iter().position(|f| f.sequence == sequence) else {
            debug!("window {}: stray ack for sequence {sequence}", self.wid);
            return vec![];
        };
        let frame = self.inflight.remove(pos).expect("indexed frame");

        let rtt_ms = now.saturating_duration_since(frame.sent_at).as_millis() as u64;
        let bandwidth_used = self.bandwidth_used_bps(now);
        self.batch.on_ack(
            now,
            &AckSample {
                rtt_ms,
                decode_time_us: decode_time_us.max(0) as u64,
                send_time_ms: 0,
                inflight: self.inflight.len() + 1,
                inflight_cap: self.inflight_cap(),
                backpressure,
                bandwidth_used_bps: bandwidth_used,
                bandwidth_limit_bps: self.bandwidth_limit_bps,
            },
        );

        let mut actions = vec![];
        if decode_time_us < 0 || !message.is_empty() {
            // Client decode failure: blacklist the encoder and repaint the
            // whole surface losslessly, right away.
            warn!(
                "window {}: client failed to decode sequence {sequence} ({}): {message}",
                self.wid, frame.encoding
            );
            if !matches!(frame.encoding.as_str(), "scroll" | "delta") {
                self.blacklist.insert(
                    frame.encoding.clone(),
                    now + self.config.encoder_error_blacklist,
                );
            }
            if self.video_encoding.as_deref() == Some(frame.encoding.as_str()) {
                self.video_encoding = None;
            }
            self.force_lossless = true;
            self.pending.collapse_to(self.bounds);
            self.state = SurfaceState::Batching;
            self.batch_generation += 1;
            actions.push(Action::ArmBatchTimer {
                generation: self.batch_generation,
                delay: Duration::from_millis(0),
            });
            return actions;
        }

        if self.state == SurfaceState::AwaitingAck {
            if !self.pending.is_empty() {
                self.state = SurfaceState::Batching;
                actions.push(self.arm_batch(now));
            } else if self.inflight.is_empty() {
                self.state = SurfaceState::Idle;
            }
        }
        actions
    }

    /// Auto-refresh timer expired with no intervening damage: emit one
    /// lossless pass over the stale region.
    pub fn refresh_fired(
        &mut self,
        generation: u64,
        now: Instant,
        backpressure: bool,
    ) -> FireOutcome {
        if generation != self.refresh_generation
            || self.refresh_region.is_empty()
            || self.state == SurfaceState::Dead
            || self.state == SurfaceState::Encoding
            || self.state == SurfaceState::Batching
        {
            return FireOutcome::Deferred(vec![]);
        }
        if backpressure || self.inflight.len() >= self.inflight_cap() {
            self.refresh_generation += 1;
            return FireOutcome::Deferred(vec![Action::ArmRefreshTimer {
                generation: self.refresh_generation,
                delay: self.config.auto_refresh_delay,
            }]);
        }
        let region = self.refresh_region.bounds().expect("non-empty refresh region");
        self.refresh_region.clear();
        let selection = match self.select_encoder(region, true, now) {
            Some(s) => s,
            None => return FireOutcome::Deferred(vec![]),
        };
        self.state = SurfaceState::Encoding;
        debug!("window {}: auto-refresh of {region}", self.wid);
        FireOutcome::Plan(
            Plan::Encode(EncodeJob {
                wid: self.wid,
                region,
                encoding: selection.encoding,
                quality: 100,
                speed: self.speed,
                lossless: true,
                content_type: self.content_type,
            }),
            vec![],
        )
    }

    /// Surface removed: terminal.
    pub fn remove(&mut self) {
        self.state = SurfaceState::Dead;
        self.pending.clear();
        self.refresh_region.clear();
        self.inflight.clear();
    }
}

/// Rows of `bounds` not written by any band, as full-width rects.
fn scroll_gaps(bands: &[ScrollBand], bounds: Rect) -> Vec<Rect> {
    let mut covered = vec![false; bounds.h as usize];
    for band in bands {
        for y in band.dst_y..(band.dst_y + band.height).min(bounds.h) {
            covered[y as usize] = true;
        }
    }
    let mut gaps = vec![];
    let mut start: Option<u32> = None;
    for y in 0..bounds.h {
        match (covered[y as usize], start) {
            (false, None) => start = Some(y),
            (true, Some(s)) => {
                gaps.push(Rect::new(bounds.x, bounds.y + s as i32, bounds.w, y - s));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        gaps.push(Rect::new(
            bounds.x,
            bounds.y + s as i32,
            bounds.w,
            bounds.h - s,
        ));
    }
    gaps
}
