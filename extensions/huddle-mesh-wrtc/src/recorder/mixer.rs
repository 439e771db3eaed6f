use std::collections::VecDeque;
use std::sync::Arc;

use huddle::media::{AudioChunk, MediaTrack};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// at most one second of audio is buffered per source
const MAX_BUFFERED_SECONDS: u32 = 1;

/// Sums a fixed set of audio tracks into one mono signal.
///
/// Every source is read by its own task into its own queue, so sources delivering
/// chunks of different sizes or at slightly different times still line up.
/// Disabled sources contribute silence.
pub struct AudioMixer {
    sample_rate: u32,
    queues: Vec<VecDeque<f32>>,
    rx: mpsc::UnboundedReceiver<(usize, Vec<f32>)>,
    readers: Vec<JoinHandle<()>>,
}

impl AudioMixer {
    /// Only samples produced after this call are mixed
    pub fn new(sample_rate: u32, tracks: impl IntoIterator<Item = Arc<MediaTrack>>) -> Self {
        let sample_rate = sample_rate.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let readers = tracks
            .into_iter()
            .enumerate()
            .map(|(index, track)| {
                let tx = tx.clone();
                let mut samples = track.subscribe_samples();
                samples.borrow_and_update();
                tokio::spawn(async move {
                    while samples.changed().await.is_ok() {
                        let Some(chunk) = samples.borrow_and_update().clone() else {
                            continue;
                        };
                        let mut converted = resample(&chunk.samples, chunk.sample_rate, sample_rate);
                        if !track.is_enabled() {
                            converted.iter_mut().for_each(|s| *s = 0.0);
                        }
                        if tx.send((index, converted)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        Self {
            sample_rate,
            queues: vec![VecDeque::new(); readers.len()],
            rx,
            readers,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn source_count(&self) -> usize {
        self.queues.len()
    }

    /// Moves everything the sources produced so far into their queues
    pub fn poll(&mut self) {
        let limit = (self.sample_rate * MAX_BUFFERED_SECONDS) as usize;
        while let Ok((index, samples)) = self.rx.try_recv() {
            let Some(queue) = self.queues.get_mut(index) else {
                continue;
            };
            queue.extend(samples);
            let excess = queue.len().saturating_sub(limit);
            queue.drain(..excess);
        }
    }

    /// Takes up to `len` samples from every queue and sums them. Missing samples are silence.
    pub fn mix(&mut self, len: usize) -> AudioChunk {
        let mut out = vec![0f32; len];
        for queue in &mut self.queues {
            let take = len.min(queue.len());
            for (slot, sample) in out.iter_mut().zip(queue.drain(..take)) {
                *slot += sample;
            }
        }
        out.iter_mut().for_each(|s| *s = s.clamp(-1.0, 1.0));
        AudioChunk::new(self.sample_rate, out)
    }
}

impl Drop for AudioMixer {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Nearest-sample rate conversion
fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let len = (samples.len() as u64 * to as u64 / from as u64) as usize;
    (0..len)
        .map(|i| {
            let index = (i as u64 * from as u64 / to as u64) as usize;
            samples[index.min(samples.len() - 1)]
        })
        .collect()
}
