//! Marks the remote participant that is currently loudest.
//!
//! The detector only reads the remote stream map. Every tick it measures the mean
//! frequency energy of each remote audio track and publishes the loudest participant
//! above the noise floor, or `None`. It idles, with the result cleared, while there
//! are no remote streams.

mod analyser;

pub use analyser::Analyser;

use std::collections::BTreeMap;
use std::sync::Arc;

use huddle::media::{MediaStream, MediaTrack};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SpeakerConfig;

/// Returns the id with the highest level above `floor`. The first id wins a tie.
pub fn loudest<'a>(
    levels: impl IntoIterator<Item = (&'a str, f32)>,
    floor: f32,
) -> Option<String> {
    let mut best: Option<(&str, f32)> = None;
    for (id, level) in levels {
        if level <= floor {
            continue;
        }
        if best.map_or(true, |(_, top)| level > top) {
            best = Some((id, level));
        }
    }
    best.map(|(id, _)| id.to_string())
}

struct Tracked {
    track: Arc<MediaTrack>,
    analyser: Analyser,
}

pub struct ActiveSpeakerDetector {
    speaker: watch::Receiver<Option<String>>,
    levels: watch::Receiver<BTreeMap<String, f32>>,
    task: JoinHandle<()>,
}

impl ActiveSpeakerDetector {
    pub fn spawn(
        streams: watch::Receiver<BTreeMap<String, MediaStream>>,
        config: SpeakerConfig,
    ) -> Self {
        let (speaker_tx, speaker) = watch::channel(None);
        let (levels_tx, levels) = watch::channel(BTreeMap::new());
        let task = tokio::spawn(run(streams, config, speaker_tx, levels_tx));
        Self {
            speaker,
            levels,
            task,
        }
    }

    pub fn current(&self) -> Option<String> {
        self.speaker.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.speaker.clone()
    }

    /// Mean energy per participant as of the last tick
    pub fn levels(&self) -> BTreeMap<String, f32> {
        self.levels.borrow().clone()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ActiveSpeakerDetector {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut streams: watch::Receiver<BTreeMap<String, MediaStream>>,
    config: SpeakerConfig,
    speaker: watch::Sender<Option<String>>,
    levels: watch::Sender<BTreeMap<String, f32>>,
) {
    let mut tracked: BTreeMap<String, Tracked> = BTreeMap::new();
    let mut ticker = tokio::time::interval(config.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if streams.borrow_and_update().is_empty() {
            tracked.clear();
            speaker.send_if_modified(|current| current.take().is_some());
            levels.send_if_modified(|current| {
                let changed = !current.is_empty();
                current.clear();
                changed
            });
            if streams.changed().await.is_err() {
                return;
            }
            continue;
        }

        tokio::select! {
            changed = streams.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        sync(&mut tracked, &streams.borrow(), &config);

        let measured = tracked
            .iter_mut()
            .map(|(id, entry)| {
                let samples = if entry.track.is_live() {
                    entry
                        .track
                        .subscribe_samples()
                        .borrow()
                        .as_ref()
                        .map(|chunk| chunk.samples.clone())
                } else {
                    None
                };
                let level = match samples {
                    Some(samples) => entry.analyser.mean_energy(&samples),
                    None => entry.analyser.mean_energy(&[]),
                };
                (id.clone(), level)
            })
            .collect::<BTreeMap<_, _>>();

        let next = loudest(
            measured.iter().map(|(id, level)| (id.as_str(), *level)),
            config.noise_floor,
        );
        speaker.send_if_modified(|current| {
            if *current != next {
                log::trace!("active speaker is now {next:?}");
                *current = next;
                true
            } else {
                false
            }
        });
        levels.send_replace(measured);
    }
}

/// Keeps analysers of unchanged tracks and replaces the rest
fn sync(
    tracked: &mut BTreeMap<String, Tracked>,
    streams: &BTreeMap<String, MediaStream>,
    config: &SpeakerConfig,
) {
    tracked.retain(|id, entry| {
        streams
            .get(id)
            .and_then(|s| s.audio_tracks().next())
            .map_or(false, |t| t.id() == entry.track.id())
    });
    for (id, stream) in streams {
        if tracked.contains_key(id) {
            continue;
        }
        if let Some(track) = stream.audio_tracks().next() {
            tracked.insert(
                id.clone(),
                Tracked {
                    track: track.clone(),
                    analyser: Analyser::new(config),
                },
            );
        }
    }
}
