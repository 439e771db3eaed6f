use std::f32::consts::PI;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

use crate::config::SpeakerConfig;

/// Frequency-domain energy of the most recent `fft_size` samples of a signal,
/// reported as one byte per bin.
///
/// Each call windows the input with a Blackman window, takes the magnitude of the
/// first `fft_size / 2` bins, smooths it against the previous call and maps the
/// decibel value from `min_decibels..max_decibels` onto `0..=255`.
pub struct Analyser {
    fft_size: usize,
    window: Vec<f32>,
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,
    smoothed: Vec<f32>,
    r2c: Arc<dyn RealToComplex<f32>>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl Analyser {
    pub fn new(config: &SpeakerConfig) -> Self {
        let n = config.fft_size.max(2);
        let window = (0..n)
            .map(|i| {
                let x = i as f32 / n as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            })
            .collect();
        let r2c = RealFftPlanner::<f32>::new().plan_fft_forward(n);
        Self {
            fft_size: n,
            window,
            smoothing: config.smoothing.clamp(0.0, 1.0),
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
            smoothed: vec![0.0; n / 2],
            input: r2c.make_input_vec(),
            spectrum: r2c.make_output_vec(),
            scratch: r2c.make_scratch_vec(),
            r2c,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn byte_frequency_data(&mut self, samples: &[f32]) -> Vec<u8> {
        let n = self.fft_size;
        // newest samples last, zero padded in front when short
        let tail = &samples[samples.len().saturating_sub(n)..];
        let offset = n - tail.len();
        for (i, slot) in self.input.iter_mut().enumerate() {
            *slot = if i < offset {
                0.0
            } else {
                tail[i - offset] * self.window[i]
            };
        }

        if let Err(e) =
            self.r2c
                .process_with_scratch(&mut self.input, &mut self.spectrum, &mut self.scratch)
        {
            log::warn!("frequency analysis failed: {e}");
            return vec![0; self.bin_count()];
        }

        let range = (self.max_decibels - self.min_decibels).max(f32::EPSILON);
        let bins = self.bin_count();
        self.spectrum[..bins]
            .iter()
            .zip(self.smoothed.iter_mut())
            .map(|(bin, previous)| {
                let magnitude = bin.norm() / n as f32;
                let smoothed = self.smoothing * *previous + (1.0 - self.smoothing) * magnitude;
                *previous = smoothed;

                let db = 20.0 * smoothed.log10();
                let scaled = (db - self.min_decibels) * 255.0 / range;
                if scaled.is_finite() {
                    scaled.clamp(0.0, 255.0) as u8
                } else {
                    0
                }
            })
            .collect()
    }

    /// Mean of [`Analyser::byte_frequency_data`]
    pub fn mean_energy(&mut self, samples: &[f32]) -> f32 {
        let data = self.byte_frequency_data(samples);
        if data.is_empty() {
            return 0.0;
        }
        data.iter().map(|b| *b as f32).sum::<f32>() / data.len() as f32
    }
}

#[cfg(test)]
mod test {
    use crate::config::SpeakerConfig;

    use super::Analyser;

    fn noise(len: usize, amplitude: f32, seed: &mut u32) -> Vec<f32> {
        (0..len)
            .map(|_| {
                *seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                amplitude * ((*seed >> 8) as f32 / (1u32 << 24) as f32 * 2.0 - 1.0)
            })
            .collect()
    }

    #[test]
    fn silence_has_no_energy() {
        let mut analyser = Analyser::new(&SpeakerConfig::default());
        assert_eq!(analyser.bin_count(), 128);
        assert_eq!(analyser.mean_energy(&[0.0; 960]), 0.0);
        assert_eq!(analyser.mean_energy(&[]), 0.0);
    }

    #[test]
    fn loud_noise_is_well_above_the_floor() {
        let config = SpeakerConfig::default();
        let mut analyser = Analyser::new(&config);
        let mut seed = 7;
        let mut energy = 0.0;
        for _ in 0..10 {
            energy = analyser.mean_energy(&noise(960, 0.8, &mut seed));
        }
        assert!(energy > config.noise_floor * 4.0, "{energy}");
    }

    #[test]
    fn tone_peaks_in_its_own_bin() {
        let config = SpeakerConfig {
            smoothing: 0.0,
            ..Default::default()
        };
        let mut analyser = Analyser::new(&config);
        let n = config.fft_size;
        let tone = (0..n)
            .map(|i| 0.005 * (2.0 * std::f32::consts::PI * 16.0 * i as f32 / n as f32).sin())
            .collect::<Vec<_>>();
        let data = analyser.byte_frequency_data(&tone);
        assert_eq!(data.len(), n / 2);
        assert!(data[16] > data[15] && data[16] > data[17], "{:?}", &data[14..19]);
        assert_eq!(data[60], 0);
    }

    #[test]
    fn smoothing_decays_after_the_signal_stops() {
        let mut analyser = Analyser::new(&SpeakerConfig::default());
        let mut seed = 11;
        for _ in 0..10 {
            analyser.mean_energy(&noise(256, 0.8, &mut seed));
        }
        let first = analyser.mean_energy(&[0.0; 256]);
        let later = (0..40)
            .map(|_| analyser.mean_energy(&[0.0; 256]))
            .last()
            .unwrap_or_default();
        assert!(first > later, "{first} {later}");
        assert!(later < SpeakerConfig::default().noise_floor);
    }
}
