//! Pubsub topic descriptors.

use std::fmt;

/// The kind of subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicKind {
    /// Point balance changes for the logged-in user (all channels).
    CommunityPointsUser,
    /// Confirmation and results of predictions placed by the user.
    PredictionsUser,
    /// Stream up/down and viewer counts for one channel.
    VideoPlayback,
    /// Raids started by one channel.
    Raid,
    /// Prediction events opened in one channel.
    PredictionsChannel,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::CommunityPointsUser => "community-points-user-v1",
            TopicKind::PredictionsUser => "predictions-user-v1",
            TopicKind::VideoPlayback => "video-playback-by-id",
            TopicKind::Raid => "raid",
            TopicKind::PredictionsChannel => "predictions-channel-v1",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "community-points-user-v1" => Some(TopicKind::CommunityPointsUser),
            "predictions-user-v1" => Some(TopicKind::PredictionsUser),
            "video-playback-by-id" => Some(TopicKind::VideoPlayback),
            "raid" => Some(TopicKind::Raid),
            "predictions-channel-v1" => Some(TopicKind::PredictionsChannel),
            _ => None,
        }
    }

    /// User-scoped topics carry the viewer's id; the channel comes from the payload.
    pub fn is_user_scoped(&self) -> bool {
        matches!(
            self,
            TopicKind::CommunityPointsUser | TopicKind::PredictionsUser
        )
    }
}

/// One subscription. Equality is by `(kind, entity_ref)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: TopicKind,
    pub entity_ref: Option<String>,
}

impl Topic {
    pub fn new(kind: TopicKind, entity_ref: impl Into<String>) -> Self {
        Self {
            kind,
            entity_ref: Some(entity_ref.into()),
        }
    }

    pub fn user(kind: TopicKind, user_id: &str) -> Self {
        Self::new(kind, user_id)
    }

    pub fn channel(kind: TopicKind, channel_id: &str) -> Self {
        Self::new(kind, channel_id)
    }

    /// Name used in LISTEN frames, e.g. `raid.12345`.
    pub fn wire_name(&self) -> String {
        match &self.entity_ref {
            Some(id) => format!("{}.{}", self.kind.as_str(), id),
            None => self.kind.as_str().to_string(),
        }
    }

    /// Parse a topic name as it appears in MESSAGE frames.
    pub fn parse(name: &str) -> Option<Self> {
        let (kind, entity_ref) = match name.split_once('.') {
            Some((kind, id)) if !id.is_empty() => (kind, Some(id.to_string())),
            Some(_) => return None,
            None => (name, None),
        };
        Some(Self {
            kind: TopicKind::parse(kind)?,
            entity_ref,
        })
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}
