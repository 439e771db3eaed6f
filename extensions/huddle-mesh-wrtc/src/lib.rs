//! Multi-party calls over a full mesh of peer links.
//!
//! [`CallController`] is the entry point: it joins a call through a
//! [`huddle::call::CallDirectory`], opens local media, links with every other
//! participant through a [`huddle::signaling::SignalingStore`] and reports what
//! happens as [`huddle::call::CallEvent`]s. Links are negotiated over a
//! [`transport::PeerTransport`], either webrtc-rs ([`transport::wrtc`]) or the
//! in-process [`transport::loopback`].
//!
//! [`ScreenViewer`] watches a screen share outside of a call and
//! [`IncomingCallWatcher`] reports calls waiting to be answered.

pub mod active_speaker;
pub mod config;
mod incoming;
mod link_manager;
pub mod media;
mod notify_wrapper;
mod peer_link;
pub mod recorder;
mod remote_streams;
mod screen_viewer;
mod synchronizer;
pub mod transport;

pub use incoming::IncomingCallWatcher;
pub use link_manager::{LinkManager, Reconciled};
pub use peer_link::{LinkContext, PeerLink};
pub use remote_streams::RemoteStreams;
pub use screen_viewer::{ScreenViewer, ViewerState};
pub use synchronizer::{CallController, CallServices, MediaState};

use huddle::module::Module;
use huddle::Extension;

/// Describes this crate to hosts that load several huddle extensions
#[derive(Debug, Default, Clone, Copy)]
pub struct MeshExtension;

impl Extension for MeshExtension {
    fn id(&self) -> String {
        "huddle-mesh-wrtc".into()
    }

    fn name(&self) -> String {
        "Mesh WebRTC".into()
    }

    fn module(&self) -> Module {
        Module::Media
    }
}
