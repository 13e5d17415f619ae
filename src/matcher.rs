/// Keyword matching over the feature stream
///
/// Each model's raw score is the mean cosine similarity between its template
/// and the most recent windows, aligned at the newest window. Scores are
/// smoothed per model; a model fires when the smoothed score reaches its
/// threshold outside its refractory period. At most one event per window:
/// the highest confidence wins.

use crate::features::FeatureWindow;
use crate::model::KeywordModel;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// A keyword match
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub hotword_id: u32,

    /// Smoothed confidence, 0.0 - 1.0
    pub confidence: f32,

    /// Monotonic stream time of the window that fired
    pub timestamp: Duration,

    pub window_index: u64,
}

struct ModelSlot {
    recent: VecDeque<f32>,
    last_fired: Option<Duration>,
}

impl ModelSlot {
    fn smoothed(&mut self, score: f32, span: usize) -> f32 {
        if self.recent.len() == span {
            self.recent.pop_front();
        }
        self.recent.push_back(score);
        self.recent.iter().sum::<f32>() / self.recent.len() as f32
    }

    fn in_refractory(&self, now: Duration, period: Duration) -> bool {
        self.last_fired
            .map(|t| now.saturating_sub(t) < period)
            .unwrap_or(false)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())).clamp(0.0, 1.0)
}

pub struct KeywordMatcher {
    models: Arc<[KeywordModel]>,
    slots: Vec<ModelSlot>,
    history: VecDeque<FeatureWindow>,
    history_len: usize,
    windows_seen: u64,
    detections: u64,
}

impl KeywordMatcher {
    pub fn new(models: Arc<[KeywordModel]>) -> Self {
        let history_len = models.iter().map(KeywordModel::frames).max().unwrap_or(1);
        let slots = models
            .iter()
            .map(|m| ModelSlot {
                recent: VecDeque::with_capacity(m.params().smoothing),
                last_fired: None,
            })
            .collect();

        debug!(
            "Keyword matcher: {} models, history of {} windows",
            models.len(),
            history_len
        );

        Self {
            models,
            slots,
            history: VecDeque::with_capacity(history_len),
            history_len,
            windows_seen: 0,
            detections: 0,
        }
    }

    /// Raw (unsmoothed) score of `model` against the current history
    pub fn score(&self, model: &KeywordModel) -> f32 {
        let frames = model.frames();
        if self.history.len() < frames {
            return 0.0;
        }

        let aligned = self.history.range(self.history.len() - frames..);
        let mut similarity = 0.0f32;
        let mut level = 0.0f32;
        for (window, row) in aligned.zip(model.template()) {
            similarity += cosine(&window.bands, row);
            level += window.level;
        }

        if level / (frames as f32) < model.params().min_level {
            return 0.0;
        }
        similarity / frames as f32
    }

    /// Feed one window; returns the event it triggers, if any
    pub fn process(&mut self, window: &FeatureWindow) -> Option<DetectionEvent> {
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(window.clone());
        self.windows_seen += 1;

        let mut winner: Option<(usize, f32)> = None;
        for (i, model) in self.models.iter().enumerate() {
            let params = model.params();
            let raw = self.score(model);
            let slot = &mut self.slots[i];
            let confidence = slot.smoothed(raw, params.smoothing);

            trace!(
                "Window {} model {}: raw={:.3} smoothed={:.3}",
                window.index,
                model.id(),
                raw,
                confidence
            );

            if confidence < params.threshold || slot.in_refractory(window.timestamp, params.refractory) {
                continue;
            }
            // Ties keep the earlier registered model
            if winner.map_or(true, |(_, best)| confidence > best) {
                winner = Some((i, confidence));
            }
        }

        let (i, confidence) = winner?;
        self.slots[i].last_fired = Some(window.timestamp);
        self.detections += 1;

        let event = DetectionEvent {
            hotword_id: self.models[i].id(),
            confidence,
            timestamp: window.timestamp,
            window_index: window.index,
        };
        debug!(
            "Hotword {} matched at {:?} (confidence {:.3})",
            event.hotword_id, event.timestamp, event.confidence
        );
        Some(event)
    }

    pub fn models(&self) -> &[KeywordModel] {
        &self.models
    }

    pub fn windows_seen(&self) -> u64 {
        self.windows_seen
    }

    pub fn detections(&self) -> u64 {
        self.detections
    }

    /// Forget history and smoothing after a gap in the audio
    ///
    /// Refractory state is kept: a keyword heard just before the gap still
    /// suppresses a repeat just after it.
    pub fn restart(&mut self) {
        self.history.clear();
        for slot in &mut self.slots {
            slot.recent.clear();
        }
    }
}
