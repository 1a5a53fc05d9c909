//! Session descriptions exchanged between loopback connections
//!
//! The format is line-oriented text shaped like SDP. Besides the usual
//! header lines it carries the originating connection and one line per
//! attached track:
//!
//! ```text
//! a=x-peer:<connection>
//! a=x-track:<track> <audio|video> <stream id>[,<stream id>...]
//! ```
//!
//! Stream ids therefore must not contain whitespace or commas.

use crate::error::{PeerLinkError, PeerLinkResult};
use crate::handle::Handle;
use crate::native::TrackKind;
use uuid::Uuid;

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

impl SdpType {
    fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }
}

/// Track announced in a description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncedTrack {
    /// Track handle on the announcing side
    pub track: Handle,
    /// Track kind
    pub kind: TrackKind,
    /// Stream ids the track belongs to
    pub stream_ids: Vec<String>,
}

/// Parsed loopback description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackSdp {
    /// Offer or answer
    pub sdp_type: SdpType,
    /// Announcing connection
    pub peer: Handle,
    /// Announced tracks
    pub tracks: Vec<AnnouncedTrack>,
}

impl LoopbackSdp {
    /// Render the description
    pub fn render(&self, session_id: Uuid) -> String {
        let mut lines = vec![
            "v=0".to_string(),
            format!("o=- {} 1 IN IP4 127.0.0.1", session_id.simple()),
            "s=peerlink-loopback".to_string(),
            "t=0 0".to_string(),
            format!("a=x-type:{}", self.sdp_type.as_str()),
            format!("a=x-peer:{}", self.peer.raw()),
        ];
        for track in &self.tracks {
            lines.push(format!(
                "a=x-track:{} {} {}",
                track.track.raw(),
                track.kind,
                track.stream_ids.join(",")
            ));
        }
        let mut sdp = lines.join("\r\n");
        sdp.push_str("\r\n");
        sdp
    }

    /// Parse a description produced by [`LoopbackSdp::render`]
    pub fn parse(sdp: &str) -> PeerLinkResult<Self> {
        let malformed = |line: &str| PeerLinkError::invalid_param(format!("malformed SDP line '{}'", line));

        let mut sdp_type = None;
        let mut peer = None;
        let mut tracks = Vec::new();

        for line in sdp.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(value) = line.strip_prefix("a=x-type:") {
                sdp_type = Some(match value {
                    "offer" => SdpType::Offer,
                    "answer" => SdpType::Answer,
                    _ => return Err(malformed(line)),
                });
            } else if let Some(value) = line.strip_prefix("a=x-peer:") {
                let raw: u64 = value.parse().map_err(|_| malformed(line))?;
                peer = Some(Handle::from_raw(raw));
            } else if let Some(value) = line.strip_prefix("a=x-track:") {
                let mut parts = value.split_whitespace();
                let (Some(track), Some(kind)) = (parts.next(), parts.next()) else {
                    return Err(malformed(line));
                };
                let track: u64 = track.parse().map_err(|_| malformed(line))?;
                let kind = match kind {
                    "audio" => TrackKind::Audio,
                    "video" => TrackKind::Video,
                    _ => return Err(malformed(line)),
                };
                let stream_ids = parts
                    .next()
                    .map(|ids| {
                        ids.split(',')
                            .filter(|id| !id.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                tracks.push(AnnouncedTrack {
                    track: Handle::from_raw(track),
                    kind,
                    stream_ids,
                });
            }
        }

        match (sdp_type, peer) {
            (Some(sdp_type), Some(peer)) => Ok(Self {
                sdp_type,
                peer,
                tracks,
            }),
            _ => Err(PeerLinkError::invalid_param(
                "SDP is missing the type or peer attribute",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_then_parse() {
        let sdp = LoopbackSdp {
            sdp_type: SdpType::Offer,
            peer: Handle::from_raw(42),
            tracks: vec![
                AnnouncedTrack {
                    track: Handle::from_raw(7),
                    kind: TrackKind::Video,
                    stream_ids: vec!["s1".to_string(), "s2".to_string()],
                },
                AnnouncedTrack {
                    track: Handle::from_raw(8),
                    kind: TrackKind::Audio,
                    stream_ids: vec![],
                },
            ],
        };
        let text = sdp.render(Uuid::new_v4());
        assert!(text.starts_with("v=0\r\n"));
        assert_eq!(LoopbackSdp::parse(&text).unwrap(), sdp);
    }

    #[test]
    fn test_parse_rejects_foreign_sdp() {
        let foreign = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\n";
        assert!(LoopbackSdp::parse(foreign).is_err());
        assert!(LoopbackSdp::parse("a=x-type:offer\na=x-peer:nope").is_err());
        assert!(LoopbackSdp::parse("a=x-type:offer\na=x-peer:1\na=x-track:3 data s").is_err());
    }
}
