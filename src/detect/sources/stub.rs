use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::detect::result::{BoundingBox, Detection, Frame};
use crate::detect::source::DetectionSource;

/// Configuration for the synthetic source.
#[derive(Clone, Debug)]
pub struct StubConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Subjects in the scene; each drifts on its own path.
    pub labels: Vec<String>,
    pub seed: u64,
    /// Probability that a frame comes back with no detections at all.
    pub dropout: f64,
    /// Sleep between frames to hold `fps`.
    pub paced: bool,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            labels: vec!["tuta".to_string(), "laura".to_string()],
            seed: 7,
            dropout: 0.05,
            paced: true,
        }
    }
}

/// Synthetic faces for demos and tests. Positions are deterministic for a
/// given seed; no pixels are involved.
pub struct StubSource {
    config: StubConfig,
    rng: StdRng,
    sequence: u64,
    next_deadline: Option<Instant>,
}

impl StubSource {
    pub fn new(config: StubConfig) -> Result<Self> {
        if config.fps == 0 {
            return Err(anyhow!("stub source fps must be >= 1"));
        }
        if !(0.0..=1.0).contains(&config.dropout) {
            return Err(anyhow!("stub source dropout must be within [0, 1]"));
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            sequence: 0,
            next_deadline: None,
        })
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.fps as f64)
    }

    fn pace(&mut self) {
        if !self.config.paced {
            return;
        }
        let interval = self.frame_interval();
        let now = Instant::now();
        match self.next_deadline {
            Some(deadline) if deadline > now => {
                std::thread::sleep(deadline - now);
                self.next_deadline = Some(deadline + interval);
            }
            _ => self.next_deadline = Some(now + interval),
        }
    }

    fn synthesize(&mut self) -> Vec<Detection> {
        if self.rng.gen_bool(self.config.dropout) {
            return Vec::new();
        }
        let t = self.sequence as f64 / self.config.fps as f64;
        let w = self.config.width as f64;
        let h = self.config.height as f64;
        let labels = self.config.labels.clone();

        labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                let phase = i as f64 * 2.1;
                let cx = w / 2.0 + 0.35 * w * (0.7 * t + phase).sin();
                let cy = h / 2.0 + 0.25 * h * (1.1 * t + phase).sin();
                let side = 90 + 20 * i as i32 + self.rng.gen_range(-4..=4);
                let jitter_x = self.rng.gen_range(-3..=3);
                let jitter_y = self.rng.gen_range(-3..=3);
                let bbox = BoundingBox::new(
                    cx as i32 - side / 2 + jitter_x,
                    cy as i32 - side / 2 + jitter_y,
                    side,
                    side,
                );
                let confidence = self.rng.gen_range(0.80f32..0.99);
                Detection::labeled(bbox, confidence, label)
            })
            .collect()
    }
}

impl DetectionSource for StubSource {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.pace();
        let observations = self.synthesize();
        let frame = Frame::new(
            self.sequence,
            self.config.width,
            self.config.height,
            observations,
        );
        self.sequence += 1;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpaced(seed: u64) -> StubConfig {
        StubConfig {
            seed,
            paced: false,
            ..StubConfig::default()
        }
    }

    #[test]
    fn same_seed_same_scene() {
        let mut a = StubSource::new(unpaced(11)).unwrap();
        let mut b = StubSource::new(unpaced(11)).unwrap();
        for _ in 0..20 {
            let fa = a.next_frame().unwrap().unwrap();
            let fb = b.next_frame().unwrap().unwrap();
            assert_eq!(a.detect(&fa).unwrap(), b.detect(&fb).unwrap());
        }
    }

    #[test]
    fn frames_are_sequenced_and_sized() {
        let mut source = StubSource::new(StubConfig {
            width: 320,
            height: 240,
            dropout: 0.0,
            ..unpaced(3)
        })
        .unwrap();
        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!((second.width, second.height), (320, 240));
        let detections = source.detect(&second).unwrap();
        assert_eq!(detections.len(), 2);
        assert!(detections[0].matches_label("tuta"));
    }

    #[test]
    fn rejects_zero_fps() {
        let config = StubConfig {
            fps: 0,
            ..StubConfig::default()
        };
        assert!(StubSource::new(config).is_err());
    }
}
