//! Token sampling.
//!
//! Converts the last-position logits of a forward pass into the next
//! token id per batch row. Two modes: greedy argmax when temperature
//! is zero (or negative), otherwise temperature-scaled softmax with
//! nucleus (top-p) truncation. Sampling runs on the CPU over an `f32`
//! copy of the logits; the vocabulary row is small compared to the
//! forward pass, so this is never the bottleneck.

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, StrataError};

/// Temperature/top-p sampler with a seeded RNG for reproducible runs.
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// Create a sampler. `temperature <= 0` selects greedy decoding
    /// and the RNG is never consulted.
    pub fn new(temperature: f32, top_p: f32, seed: u64) -> Self {
        Self {
            temperature,
            top_p,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Deterministic argmax sampler.
    pub fn greedy() -> Self {
        Self::new(0.0, 1.0, 0)
    }

    /// Sample one token id per row of `logits` with shape `[batch, vocab]`.
    pub fn sample(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        let rows = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut picked = Vec::with_capacity(rows.len());
        for row in &rows {
            picked.push(self.sample_row(row)?);
        }
        Ok(picked)
    }

    fn sample_row(&mut self, logits: &[f32]) -> Result<u32> {
        if self.temperature <= 0.0 {
            return argmax(logits);
        }
        let probs = softmax(logits, self.temperature);
        self.sample_top_p(&probs)
    }

    /// Nucleus sampling: keep the smallest set of tokens whose
    /// cumulative probability reaches `top_p`, renormalize, then draw.
    /// A token is kept when the mass of strictly higher-ranked tokens
    /// has not yet exceeded the threshold, so the top-1 token always
    /// survives even when `top_p == 0`.
    fn sample_top_p(&mut self, probs: &[f32]) -> Result<u32> {
        let mut ranked: Vec<(u32, f32)> = probs
            .iter()
            .enumerate()
            .map(|(id, &p)| (id as u32, p))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut before = 0.0f32;
        let mut kept_mass = 0.0f32;
        for (_, p) in ranked.iter_mut() {
            let prob = *p;
            if before > self.top_p {
                *p = 0.0;
            } else {
                kept_mass += prob;
            }
            before += prob;
        }
        if kept_mass <= 0.0 {
            return Err(StrataError::GenerationError(
                "sampling distribution has no mass".to_string(),
            ));
        }

        let draw = self.rng.gen_range(0.0f32..1.0f32);
        let mut cumulative = 0.0f32;
        let mut last_kept = ranked[0].0;
        for (id, p) in &ranked {
            if *p == 0.0 {
                continue;
            }
            last_kept = *id;
            cumulative += p / kept_mass;
            if draw < cumulative {
                return Ok(*id);
            }
        }
        // Rounding can leave the renormalized mass fractionally short
        // of 1.0; the draw then lands on the lowest-ranked kept token.
        Ok(last_kept)
    }
}

fn argmax(logits: &[f32]) -> Result<u32> {
    let mut best: Option<(u32, f32)> = None;
    for (id, &value) in logits.iter().enumerate() {
        match best {
            Some((_, top)) if value <= top => {}
            _ => best = Some((id as u32, value)),
        }
    }
    best.map(|(id, _)| id)
        .ok_or_else(|| StrataError::GenerationError("empty logits row".to_string()))
}

fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut probs: Vec<f32> = logits
        .iter()
        .map(|&l| ((l - max_logit) / temperature).exp())
        .collect();
    let sum: f32 = probs.iter().sum();
    for p in probs.iter_mut() {
        *p /= sum;
    }
    probs
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(rows: &[&[f32]]) -> Tensor {
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_slice(&flat, (rows.len(), rows[0].len()), &Device::Cpu).unwrap()
    }

    #[test]
    fn greedy_picks_the_largest_logit() {
        let mut sampler = Sampler::greedy();
        let picked = sampler.sample(&logits(&[&[0.1, 3.0, -1.0, 2.0]])).unwrap();
        assert_eq!(picked, vec![1]);
    }

    #[test]
    fn batch_rows_are_sampled_independently() {
        let mut sampler = Sampler::greedy();
        let picked = sampler
            .sample(&logits(&[&[5.0, 0.0, 0.0], &[0.0, 0.0, 5.0]]))
            .unwrap();
        assert_eq!(picked, vec![0, 2]);
    }

    #[test]
    fn tiny_top_p_degenerates_to_argmax() {
        // Probabilities ~ [0.6, 0.3, 0.1]; with top_p = 0 only the
        // top-ranked token survives truncation.
        let row = [6.0f32.ln(), 3.0f32.ln(), 1.0f32.ln()];
        let mut sampler = Sampler::new(1.0, 0.0, 7);
        for _ in 0..50 {
            let picked = sampler.sample(&logits(&[&row])).unwrap();
            assert_eq!(picked, vec![0]);
        }
    }

    #[test]
    fn nucleus_truncation_drops_the_tail() {
        // Mass before the third-ranked token is 0.9 > 0.5, so token 2
        // can never be drawn.
        let row = [6.0f32.ln(), 3.0f32.ln(), 1.0f32.ln()];
        let mut sampler = Sampler::new(1.0, 0.5, 11);
        for _ in 0..100 {
            let picked = sampler.sample(&logits(&[&row])).unwrap();
            assert_ne!(picked[0], 2);
        }
    }

    #[test]
    fn same_seed_reproduces_the_stream() {
        let row: Vec<f32> = (0..16).map(|i| (i as f32 * 0.37).sin()).collect();
        let input = logits(&[&row]);
        let mut a = Sampler::new(0.9, 0.95, 1234);
        let mut b = Sampler::new(0.9, 0.95, 1234);
        for _ in 0..20 {
            assert_eq!(a.sample(&input).unwrap(), b.sample(&input).unwrap());
        }
    }

    #[test]
    fn sampled_ids_stay_in_the_vocabulary() {
        let row: Vec<f32> = (0..8).map(|i| (i as f32 * 0.11).cos()).collect();
        let input = logits(&[&row]);
        let mut sampler = Sampler::new(1.2, 0.9, 99);
        for _ in 0..200 {
            let picked = sampler.sample(&input).unwrap();
            assert!(picked[0] < 8);
        }
    }
}
