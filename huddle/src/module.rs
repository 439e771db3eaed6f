use derive_more::Display;
use serde::{Deserialize, Serialize};

/// `Signaling` - Relays session descriptions and connectivity candidates between
///             the two sides of every participant pair in a call.
///
/// `Calls` - Keeps the shared call record (status, roster, flags) and delivers every
///         change of it to the participants.
///
/// `Media` - Negotiates peer links and moves local and remote media between participants.
///
#[derive(Hash, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    /// Offer/answer and candidate relay for participant pairs
    #[display(fmt = "signaling")]
    Signaling,

    /// Shared call records and their observation channel
    #[display(fmt = "calls")]
    Calls,

    /// Peer links, local capture, recording and uploads
    #[display(fmt = "media")]
    Media,

    /// Unknown module. Should be used by default where a module cannot be identified for any specific reason.
    #[display(fmt = "unknown")]
    Unknown,
}

impl Default for Module {
    fn default() -> Self {
        Self::Unknown
    }
}

impl<A> From<A> for Module
where
    A: AsRef<str>,
{
    fn from(module: A) -> Self {
        match module.as_ref() {
            "signaling" => Module::Signaling,
            "calls" => Module::Calls,
            "media" => Module::Media,
            _ => Module::Unknown,
        }
    }
}

#[cfg(test)]
mod test {
    use super::Module;

    #[test]
    fn module_names_round_trip() {
        for module in [Module::Signaling, Module::Calls, Module::Media] {
            assert_eq!(Module::from(module.to_string()), module);
        }
        assert_eq!(Module::from("raygun"), Module::Unknown);
    }
}
