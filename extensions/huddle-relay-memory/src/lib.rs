//! In-process implementation of every collaborator a call needs: the signaling
//! relay, the screen share relay, the call directory, upload signing and the
//! media host. Clones share the same state, so one relay can serve every
//! participant of a simulated call.

mod calls;
mod feed;
mod signaling;
mod uploads;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use huddle::call::CallSession;
use huddle::module::Module;
use huddle::signaling::SessionKey;
use huddle::upload::RecordingRecord;
use huddle::Extension;
use parking_lot::{Mutex, RwLock};

use feed::Feed;
use signaling::{ScreenSlot, SessionSlot};

#[derive(Default)]
struct Failures {
    authorization: bool,
    upload: bool,
}

#[derive(Default)]
struct Inner {
    sessions: RwLock<HashMap<SessionKey, SessionSlot>>,
    screens: RwLock<HashMap<String, ScreenSlot>>,
    calls: RwLock<HashMap<String, Feed<Option<CallSession>>>>,
    recordings: RwLock<Vec<RecordingRecord>>,
    uploads: RwLock<HashMap<String, Bytes>>,
    signatures: Mutex<HashSet<String>>,
    failures: Mutex<Failures>,
}

#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Inner>,
}

impl Extension for MemoryRelay {
    fn id(&self) -> String {
        String::from("huddle-relay-memory")
    }

    fn name(&self) -> String {
        String::from("In-Memory Call Relay")
    }

    fn module(&self) -> Module {
        Module::Signaling
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }
}
