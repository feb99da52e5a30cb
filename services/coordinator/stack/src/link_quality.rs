//! RSSI to LQI mapping and link quality assessment

use std::collections::VecDeque;

/// Fraction of the RSSI window where the logistic curve is centred
const LOGISTIC_MIDPOINT: f64 = 0.45;
/// Logistic slope per dBm
const LOGISTIC_SLOPE: f64 = 0.13;

/// Map RSSI to LQI through a logistic curve over `[min, max]`.
///
/// Values at or beyond the window edges map to 0 and 255.
pub fn map_rssi_to_lqi(rssi: i8, min: i8, max: i8) -> u8 {
    if rssi <= min {
        return 0;
    }
    if rssi >= max {
        return 255;
    }

    let span = max as f64 - min as f64;
    let midpoint = min as f64 + LOGISTIC_MIDPOINT * span;
    let value = 255.0 / (1.0 + (-LOGISTIC_SLOPE * (rssi as f64 - midpoint)).exp());
    value.round().clamp(0.0, 255.0) as u8
}

/// Linear position of `rssi` in the window, scaled to 0..=255
fn normalize_rssi(rssi: i8, min: i8, max: i8) -> f64 {
    if max <= min {
        return 0.0;
    }
    let clamped = rssi.clamp(min, max) as f64;
    (clamped - min as f64) / (max as f64 - min as f64) * 255.0
}

/// Link quality assessment of a single reception
pub fn compute_lqa(rssi: i8, lqi: Option<u8>, min: i8, max: i8) -> u8 {
    let lqi = lqi.unwrap_or_else(|| map_rssi_to_lqi(rssi, min, max)) as f64;
    ((normalize_rssi(rssi, min, max) + lqi) / 2.0).round() as u8
}

/// Translate an LQA into a Zigbee link cost (1 best, 7 worst)
pub fn lqa_to_link_cost(lqa: u8) -> u8 {
    match lqa {
        200..=255 => 1,
        150..=199 => 2,
        110..=149 => 3,
        80..=109 => 4,
        50..=79 => 5,
        25..=49 => 6,
        _ => 7,
    }
}

/// One reception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSample {
    /// Received signal strength
    pub rssi: i8,
    /// Derived LQI
    pub lqi: u8,
}

/// Bounded history of recent receptions from one device
#[derive(Debug, Clone, Default)]
pub struct LinkQualityWindow {
    samples: VecDeque<LinkSample>,
}

impl LinkQualityWindow {
    /// Record a sample, keeping at most `capacity`
    pub fn push(&mut self, sample: LinkSample, capacity: usize) {
        self.samples.push_back(sample);
        while self.samples.len() > capacity.max(1) {
            self.samples.pop_front();
        }
    }

    /// Number of samples held
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample was recorded yet
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Composite LQA over the `max_recent` newest samples: mean LQI blended
    /// with the weakest RSSI seen
    pub fn lqa(&self, max_recent: usize, min: i8, max: i8) -> Option<u8> {
        let recent: Vec<&LinkSample> = self.samples.iter().rev().take(max_recent.max(1)).collect();
        if recent.is_empty() {
            return None;
        }

        let mean_lqi = recent.iter().map(|s| s.lqi as f64).sum::<f64>() / recent.len() as f64;
        let weakest = recent.iter().map(|s| s.rssi).min()?;
        Some(((mean_lqi + normalize_rssi(weakest, min, max)) / 2.0).round() as u8)
    }
}
