use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LensError, Result};

pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 0.1..=2.0;
pub const TOP_K_RANGE: RangeInclusive<u32> = 0..=100;
pub const TOP_P_RANGE: RangeInclusive<f64> = 0.1..=1.0;
pub const MAX_NEW_TOKENS_RANGE: RangeInclusive<u32> = 10..=200;

/// Parameters shared by the analysis and generation calls. `top_k == 0`
/// disables top-k filtering on the service side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub prompt: String,
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub max_new_tokens: u32,
    pub sample: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            prompt: "The future of artificial intelligence is".to_string(),
            temperature: 0.8,
            top_k: 40,
            top_p: 0.9,
            max_new_tokens: 60,
            sample: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Precise,
    Creative,
}

impl SamplingConfig {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Overwrites the sampling knobs, keeping prompt and length settings.
    pub fn apply_preset(&mut self, preset: Preset) {
        let (temperature, top_k, top_p) = match preset {
            Preset::Precise => (0.3, 10, 0.8),
            Preset::Creative => (1.2, 50, 0.95),
        };
        self.temperature = temperature;
        self.top_k = top_k;
        self.top_p = top_p;
    }

    /// Copy with every numeric field pulled into its documented range.
    /// Non-finite floats are left untouched for `validated` to reject.
    pub fn clamped(&self) -> Self {
        Self {
            prompt: self.prompt.clone(),
            temperature: clamp_f64(self.temperature, &TEMPERATURE_RANGE),
            top_k: self.top_k.min(*TOP_K_RANGE.end()),
            top_p: clamp_f64(self.top_p, &TOP_P_RANGE),
            max_new_tokens: self
                .max_new_tokens
                .clamp(*MAX_NEW_TOKENS_RANGE.start(), *MAX_NEW_TOKENS_RANGE.end()),
            sample: self.sample,
        }
    }

    /// Returns the configuration that is safe to put on the wire. Fails
    /// locally on an empty prompt so no request is ever dispatched for it.
    pub fn validated(&self) -> Result<Self> {
        if self.prompt.trim().is_empty() {
            return Err(LensError::Validation("prompt must not be empty".into()));
        }
        for (name, value) in [("temperature", self.temperature), ("top_p", self.top_p)] {
            if !value.is_finite() {
                return Err(LensError::Validation(format!(
                    "{name} must be a finite number"
                )));
            }
        }

        let clamped = self.clamped();
        if clamped != *self {
            debug!(
                temperature = clamped.temperature,
                top_k = clamped.top_k,
                top_p = clamped.top_p,
                max_new_tokens = clamped.max_new_tokens,
                "sampling parameters clamped"
            );
        }
        Ok(clamped)
    }

    pub fn top_k_enabled(&self) -> bool {
        self.top_k > 0
    }

    pub fn temperature_label(&self) -> &'static str {
        match self.temperature {
            t if t < 0.5 => "Conservative",
            t if t < 1.0 => "Balanced",
            t if t < 1.5 => "Creative",
            _ => "Very Creative",
        }
    }
}

fn clamp_f64(value: f64, range: &RangeInclusive<f64>) -> f64 {
    if value.is_finite() {
        value.clamp(*range.start(), *range.end())
    } else {
        value
    }
}
