//! Keeps exactly one [`PeerLink`] per remote participant of the current roster.

use std::collections::BTreeMap;
use std::sync::Arc;

use huddle::error::Error;
use huddle::media::{MediaStream, MediaTrack};
use huddle::signaling::SignalingStore;
use tokio::sync::mpsc;

use crate::peer_link::{LinkContext, PeerLink};
use crate::remote_streams::RemoteStreams;
use crate::transport::{TransportConfig, TransportFactory};

/// Result of one [`LinkManager::reconcile`] pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    /// Remote participants left unlinked because the mesh is full
    pub skipped: Vec<String>,
}

pub struct LinkManager {
    ctx: LinkContext,
    max_mesh_size: usize,
    links: BTreeMap<String, PeerLink>,
    resets: mpsc::UnboundedReceiver<String>,
}

impl LinkManager {
    pub fn new(
        local_id: &str,
        call_id: &str,
        store: Arc<dyn SignalingStore>,
        factory: Arc<dyn TransportFactory>,
        transport_config: TransportConfig,
        max_mesh_size: usize,
    ) -> Self {
        let (tx, resets) = mpsc::unbounded_channel();
        Self {
            ctx: LinkContext {
                local_id: local_id.to_string(),
                call_id: call_id.to_string(),
                store,
                factory,
                transport_config,
                remote_streams: RemoteStreams::new(),
                resets: tx,
            },
            max_mesh_size,
            links: BTreeMap::new(),
            resets,
        }
    }

    pub fn remote_streams(&self) -> &RemoteStreams {
        &self.ctx.remote_streams
    }

    pub fn local_id(&self) -> &str {
        &self.ctx.local_id
    }

    pub fn call_id(&self) -> &str {
        &self.ctx.call_id
    }

    /// Ids with a live link, in ascending order
    pub fn linked(&self) -> Vec<String> {
        self.links.keys().cloned().collect()
    }

    pub fn link(&self, remote_id: &str) -> Option<&PeerLink> {
        self.links.get(remote_id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Brings the set of links in line with `participant_ids`. The local id is
    /// ignored. Links to ids that left the roster are torn down, new ids get a
    /// link, and existing links are left alone. At most `max_mesh_size - 1` remote
    /// participants are linked, lowest ids first.
    pub async fn reconcile(
        &mut self,
        participant_ids: &[String],
        local_stream: Option<&MediaStream>,
    ) -> Reconciled {
        let mut remotes = participant_ids
            .iter()
            .filter(|id| **id != self.ctx.local_id)
            .cloned()
            .collect::<Vec<_>>();
        remotes.sort();
        remotes.dedup();

        let capacity = self.max_mesh_size.saturating_sub(1);
        let skipped = if remotes.len() > capacity {
            remotes.split_off(capacity)
        } else {
            vec![]
        };
        if !skipped.is_empty() {
            log::warn!(
                "call {} has {} participants, more than the mesh limit of {}",
                self.ctx.call_id,
                remotes.len() + skipped.len() + 1,
                self.max_mesh_size
            );
        }

        let mut report = Reconciled {
            skipped,
            ..Default::default()
        };

        let stale = self
            .links
            .keys()
            .filter(|id| !remotes.contains(id))
            .cloned()
            .collect::<Vec<_>>();
        for id in stale {
            self.teardown(&id).await;
            report.closed.push(id);
        }

        for id in remotes {
            if self.links.contains_key(&id) {
                continue;
            }
            match PeerLink::open(&self.ctx, &id, local_stream).await {
                Ok(link) => {
                    self.links.insert(id.clone(), link);
                    report.opened.push(id);
                }
                Err(e) => log::error!("failed to create link to {id}: {e}"),
            }
        }

        report
    }

    /// Closes the link to `remote_id` and forgets its remote stream
    pub async fn teardown(&mut self, remote_id: &str) {
        if let Some(mut link) = self.links.remove(remote_id) {
            link.close().await;
        }
        self.ctx.remote_streams.remove(remote_id);
    }

    pub async fn teardown_all(&mut self) {
        let links = std::mem::take(&mut self.links);
        for (_, mut link) in links {
            link.close().await;
        }
        self.ctx.remote_streams.clear();
    }

    /// Replaces the link to `remote_id` with a fresh one, for when the other side
    /// started over
    pub async fn restart(
        &mut self,
        remote_id: &str,
        local_stream: Option<&MediaStream>,
    ) -> Result<(), Error> {
        if !self.links.contains_key(remote_id) {
            return Ok(());
        }
        self.teardown(remote_id).await;
        let link = PeerLink::open(&self.ctx, remote_id, local_stream).await?;
        self.links.insert(remote_id.to_string(), link);
        log::info!("link to {remote_id} restarted");
        Ok(())
    }

    /// Resolves with the id of the next link whose signaling record was deleted.
    /// Never resolves while nothing is pending.
    pub async fn next_reset(&mut self) -> String {
        loop {
            // the manager holds a sender itself, so the channel never closes
            if let Some(id) = self.resets.recv().await {
                if self.links.contains_key(&id) {
                    return id;
                }
            }
        }
    }

    /// Puts `track` on the video sender of every link. Failures are logged per link.
    pub async fn replace_video(&self, track: Option<Arc<MediaTrack>>) {
        for (id, link) in &self.links {
            if let Err(e) = link.swap_video(track.clone()).await {
                log::warn!("failed to replace video towards {id}: {e}");
            }
        }
    }
}
