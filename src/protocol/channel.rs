//! Logical channel identifiers

use std::fmt;

/// Label of the control-plane channel
pub const META_LABEL: &str = "meta";
/// Label of the client → car command channel
pub const CONTROL_LABEL: &str = "control";
/// Label of the car → client media channel
pub const FRAME_LABEL: &str = "frame";

/// One of the three logical channels inside a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Control-plane envelopes
    Meta,
    /// Opaque control commands
    Control,
    /// Opaque media frames
    Frame,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Meta, ChannelKind::Control, ChannelKind::Frame];

    /// Transport-level label for this channel
    pub fn label(self) -> &'static str {
        match self {
            ChannelKind::Meta => META_LABEL,
            ChannelKind::Control => CONTROL_LABEL,
            ChannelKind::Frame => FRAME_LABEL,
        }
    }

    /// Resolve a transport-level label. Unknown labels yield `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            META_LABEL => Some(ChannelKind::Meta),
            CONTROL_LABEL => Some(ChannelKind::Control),
            FRAME_LABEL => Some(ChannelKind::Frame),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_lookup() {
        for kind in ChannelKind::ALL {
            assert_eq!(ChannelKind::from_label(kind.label()), Some(kind));
        }
        assert_eq!(ChannelKind::from_label("telemetry"), None);
        assert_eq!(ChannelKind::from_label("Meta"), None);
    }
}
