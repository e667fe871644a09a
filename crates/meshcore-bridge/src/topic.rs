//! Broker topic derivation
//!
//! Every envelope is published to `<prefix><suffix>`:
//!
//! - group packets (GRP_TXT, GRP_DATA) use the channel name when the channel
//!   lookup knows it, sanitized to `[A-Za-z0-9._-]` with spaces mapped to `_`;
//! - otherwise the channel hash as two uppercase hex digits;
//!   a known name that sanitizes to nothing leaves the suffix empty;
//! - every other packet uses `all`.
//!
//! Subscribers rely on these names, so the fallback chain must stay exactly
//! as written here.

use std::sync::Arc;

use crate::packet::PacketView;

/// Suffix for packets that are not bound to a channel
pub const TOPIC_SUFFIX_ALL: &str = "all";

/// Suffix the broker transport subscribes to in bidirectional mode
pub const TOPIC_SUFFIX_RX: &str = "rx";

/// Read-only channel metadata supplied by the mesh engine
pub trait ChannelNameLookup: Send + Sync {
    /// Name of the channel with this hash, if known
    fn lookup_channel_name(&self, channel_hash: u8) -> Option<String>;
}

impl<F> ChannelNameLookup for F
where
    F: Fn(u8) -> Option<String> + Send + Sync,
{
    fn lookup_channel_name(&self, channel_hash: u8) -> Option<String> {
        self(channel_hash)
    }
}

/// Shared channel lookup handle
pub type SharedChannelLookup = Arc<dyn ChannelNameLookup>;

/// Reduce a channel name to topic-safe characters
pub fn sanitize_channel_name(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            ' ' => Some('_'),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => Some(c),
            _ => None,
        })
        .collect()
}

/// Topic suffix for a channel hash
pub fn channel_suffix(channel_hash: u8, lookup: Option<&dyn ChannelNameLookup>) -> String {
    lookup
        .and_then(|lookup| lookup.lookup_channel_name(channel_hash))
        .filter(|name| !name.is_empty())
        .map(|name| sanitize_channel_name(&name))
        .unwrap_or_else(|| format!("{:02X}", channel_hash))
}

/// Builds publish topics under a fixed prefix
#[derive(Debug, Clone)]
pub struct TopicMapper {
    prefix: String,
}

impl TopicMapper {
    /// Create a mapper for `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Topic prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Topic for a channel hash
    pub fn channel_topic(&self, channel_hash: u8, lookup: Option<&dyn ChannelNameLookup>) -> String {
        format!("{}{}", self.prefix, channel_suffix(channel_hash, lookup))
    }

    /// Topic for packets without a channel
    pub fn broadcast_topic(&self) -> String {
        format!("{}{}", self.prefix, TOPIC_SUFFIX_ALL)
    }

    /// Topic the bridge listens on for inbound envelopes
    pub fn receive_topic(&self) -> String {
        format!("{}{}", self.prefix, TOPIC_SUFFIX_RX)
    }

    /// Topic for a serialized mesh packet
    pub fn packet_topic(&self, packet: &[u8], lookup: Option<&dyn ChannelNameLookup>) -> String {
        match PacketView::parse(packet).and_then(|view| view.channel_hash()) {
            Some(channel_hash) => self.channel_topic(channel_hash, lookup),
            None => self.broadcast_topic(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{header_byte, PayloadType, RouteType};

    fn group_packet(channel_hash: u8) -> Vec<u8> {
        vec![
            header_byte(PayloadType::GrpTxt, RouteType::Flood),
            0x00,
            channel_hash,
            0x12,
            0x34,
        ]
    }

    #[test]
    fn test_hex_fallback_without_lookup() {
        let mapper = TopicMapper::new("meshcore/");
        assert_eq!(mapper.channel_topic(0xD5, None), "meshcore/D5");
        assert_eq!(mapper.channel_topic(0x0A, None), "meshcore/0A");
    }

    #[test]
    fn test_sanitized_channel_name() {
        let mapper = TopicMapper::new("meshcore/");
        let lookup = |_: u8| Some("My Channel!".to_string());
        assert_eq!(mapper.channel_topic(0x01, Some(&lookup)), "meshcore/My_Channel");
    }

    #[test]
    fn test_sanitize_rules() {
        assert_eq!(sanitize_channel_name("a.b_c-d e"), "a.b_c-d_e");
        assert_eq!(sanitize_channel_name("#public/été"), "publict");
        assert_eq!(sanitize_channel_name("+++"), "");
    }

    #[test]
    fn test_empty_or_unknown_name_falls_back_to_hex() {
        let mapper = TopicMapper::new("meshcore/");
        let empty = |_: u8| Some(String::new());
        assert_eq!(mapper.channel_topic(0x2B, Some(&empty)), "meshcore/2B");

        let unknown = |_: u8| None;
        assert_eq!(mapper.channel_topic(0x2B, Some(&unknown)), "meshcore/2B");
    }

    #[test]
    fn test_name_without_topic_characters_keeps_empty_suffix() {
        let mapper = TopicMapper::new("meshcore/");
        let symbols = |_: u8| Some("!!!".to_string());
        assert_eq!(mapper.channel_topic(0x2B, Some(&symbols)), "meshcore/");
    }

    #[test]
    fn test_packet_topic() {
        let mapper = TopicMapper::new("meshcore/");
        let lookup = |hash: u8| (hash == 0x11).then(|| "Sensors".to_string());

        assert_eq!(mapper.packet_topic(&group_packet(0x11), Some(&lookup)), "meshcore/Sensors");
        assert_eq!(mapper.packet_topic(&group_packet(0xD5), Some(&lookup)), "meshcore/D5");

        let advert = [header_byte(PayloadType::Advert, RouteType::Flood), 0x00, 0xD5];
        assert_eq!(mapper.packet_topic(&advert, Some(&lookup)), "meshcore/all");
    }

    #[test]
    fn test_unparseable_packet_goes_to_all() {
        let mapper = TopicMapper::new("meshcore/");
        assert_eq!(mapper.packet_topic(&[], None), "meshcore/all");
        let truncated = [header_byte(PayloadType::GrpTxt, RouteType::Flood)];
        assert_eq!(mapper.packet_topic(&truncated, None), "meshcore/all");
    }

    #[test]
    fn test_receive_topic() {
        assert_eq!(TopicMapper::new("net/").receive_topic(), "net/rx");
    }
}
