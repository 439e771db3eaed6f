use std::collections::BTreeMap;
use std::sync::Arc;

use huddle::media::{MediaStream, MediaTrack};
use tokio::sync::watch;

/// Remote stream per participant id, ordered by id.
///
/// Written only by the peer links of one call. The active-speaker detector and the
/// recorder hold receivers and never write.
#[derive(Clone)]
pub struct RemoteStreams {
    tx: Arc<watch::Sender<BTreeMap<String, MediaStream>>>,
}

impl Default for RemoteStreams {
    fn default() -> Self {
        let (tx, _) = watch::channel(BTreeMap::new());
        Self { tx: Arc::new(tx) }
    }
}

impl RemoteStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `track` to the stream rendered for `participant_id`. A different
    /// `stream_id` replaces the previous stream.
    pub(crate) fn publish_track(&self, participant_id: &str, stream_id: &str, track: Arc<MediaTrack>) {
        self.tx.send_modify(|streams| {
            let stream = streams
                .entry(participant_id.to_string())
                .or_insert_with(|| MediaStream::new(stream_id));
            if stream.id() != stream_id {
                *stream = MediaStream::new(stream_id);
            }
            stream.add_track(track);
        });
    }

    pub(crate) fn remove(&self, participant_id: &str) {
        self.tx
            .send_if_modified(|streams| streams.remove(participant_id).is_some());
    }

    pub(crate) fn clear(&self) {
        self.tx.send_if_modified(|streams| {
            let changed = !streams.is_empty();
            streams.clear();
            changed
        });
    }

    pub fn get(&self, participant_id: &str) -> Option<MediaStream> {
        self.tx.borrow().get(participant_id).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, MediaStream> {
        self.tx.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.borrow().is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<String, MediaStream>> {
        self.tx.subscribe()
    }
}
