//! Read-only header view of a serialized mesh packet
//!
//! The bridge treats packets as opaque bytes. The only thing it ever looks at
//! is the header, to find the payload type and the first payload byte when a
//! broker topic is derived.
//!
//! Packet layout:
//! - Byte 0: header (`route_type` bits 0-1, `payload_type` bits 2-5, version bits 6-7)
//! - 4 bytes of transport codes for the two transport route types
//! - 1 byte path length, then the path
//! - Remaining bytes: payload

/// Route type carried in the low two header bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    /// Flood with transport codes
    TransportFlood,
    /// Flood
    Flood,
    /// Direct along a path
    Direct,
    /// Direct with transport codes
    TransportDirect,
}

impl RouteType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0x00 => RouteType::TransportFlood,
            0x01 => RouteType::Flood,
            0x02 => RouteType::Direct,
            _ => RouteType::TransportDirect,
        }
    }

    /// Whether four bytes of transport codes follow the header
    pub fn has_transport_codes(&self) -> bool {
        matches!(self, RouteType::TransportFlood | RouteType::TransportDirect)
    }
}

/// Payload type carried in header bits 2-5
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    /// Request
    Req = 0x00,
    /// Response to a request
    Response = 0x01,
    /// Direct text message
    TxtMsg = 0x02,
    /// Acknowledgement
    Ack = 0x03,
    /// Node advertisement
    Advert = 0x04,
    /// Group (channel) text
    GrpTxt = 0x05,
    /// Group (channel) datagram
    GrpData = 0x06,
    /// Anonymous request
    AnonReq = 0x07,
    /// Returned path
    Path = 0x08,
    /// Trace
    Trace = 0x09,
    /// Multipart fragment
    Multipart = 0x0A,
    /// Control / discovery
    Control = 0x0B,
    /// Application-defined raw payload
    RawCustom = 0x0F,
    /// Any value this crate does not name
    Unknown = 0xFF,
}

impl From<u8> for PayloadType {
    fn from(value: u8) -> Self {
        match value {
            0x00 => PayloadType::Req,
            0x01 => PayloadType::Response,
            0x02 => PayloadType::TxtMsg,
            0x03 => PayloadType::Ack,
            0x04 => PayloadType::Advert,
            0x05 => PayloadType::GrpTxt,
            0x06 => PayloadType::GrpData,
            0x07 => PayloadType::AnonReq,
            0x08 => PayloadType::Path,
            0x09 => PayloadType::Trace,
            0x0A => PayloadType::Multipart,
            0x0B => PayloadType::Control,
            0x0F => PayloadType::RawCustom,
            _ => PayloadType::Unknown,
        }
    }
}

impl PayloadType {
    /// Group payloads start with a channel hash byte
    pub fn is_group(&self) -> bool {
        matches!(self, PayloadType::GrpTxt | PayloadType::GrpData)
    }
}

/// Borrowed view over a serialized mesh packet
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    header: u8,
    path: &'a [u8],
    payload: &'a [u8],
}

impl<'a> PacketView<'a> {
    /// Parse the header; `None` if the buffer is too short for what it declares
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let (&header, mut rest) = data.split_first()?;

        if RouteType::from_bits(header).has_transport_codes() {
            rest = rest.get(4..)?;
        }

        let (&path_len, rest) = rest.split_first()?;
        let path_len = path_len as usize;
        let path = rest.get(..path_len)?;
        let payload = &rest[path_len..];

        Some(Self {
            header,
            path,
            payload,
        })
    }

    /// Raw header byte
    pub fn header(&self) -> u8 {
        self.header
    }

    /// Route type
    pub fn route_type(&self) -> RouteType {
        RouteType::from_bits(self.header)
    }

    /// Payload type
    pub fn payload_type(&self) -> PayloadType {
        PayloadType::from((self.header >> 2) & 0x0F)
    }

    /// Payload format version
    pub fn payload_version(&self) -> u8 {
        self.header >> 6
    }

    /// Path bytes
    pub fn path(&self) -> &'a [u8] {
        self.path
    }

    /// Payload bytes
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Channel hash of a group payload
    pub fn channel_hash(&self) -> Option<u8> {
        if self.payload_type().is_group() {
            self.payload.first().copied()
        } else {
            None
        }
    }
}

/// Build a header byte; used by tests and tools that synthesize packets
pub fn header_byte(payload_type: PayloadType, route_type: RouteType) -> u8 {
    let route = match route_type {
        RouteType::TransportFlood => 0x00,
        RouteType::Flood => 0x01,
        RouteType::Direct => 0x02,
        RouteType::TransportDirect => 0x03,
    };
    ((payload_type as u8 & 0x0F) << 2) | route
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flood_group_packet() {
        let header = header_byte(PayloadType::GrpTxt, RouteType::Flood);
        assert_eq!(header, 0x15);
        let data = [header, 0x02, 0xAA, 0xBB, 0xD5, 0x01, 0x02];

        let view = PacketView::parse(&data).unwrap();
        assert_eq!(view.route_type(), RouteType::Flood);
        assert_eq!(view.payload_type(), PayloadType::GrpTxt);
        assert_eq!(view.path(), &[0xAA, 0xBB]);
        assert_eq!(view.payload(), &[0xD5, 0x01, 0x02]);
        assert_eq!(view.channel_hash(), Some(0xD5));
    }

    #[test]
    fn test_parse_skips_transport_codes() {
        let header = header_byte(PayloadType::GrpData, RouteType::TransportFlood);
        let data = [header, 1, 2, 3, 4, 0x00, 0x7F, 0x99];
        let view = PacketView::parse(&data).unwrap();
        assert!(view.path().is_empty());
        assert_eq!(view.channel_hash(), Some(0x7F));
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(PacketView::parse(&[]).is_none());
        let header = header_byte(PayloadType::TxtMsg, RouteType::Direct);
        assert!(PacketView::parse(&[header]).is_none());
        assert!(PacketView::parse(&[header, 0x05, 0x01]).is_none());
        let transport = header_byte(PayloadType::Ack, RouteType::TransportDirect);
        assert!(PacketView::parse(&[transport, 1, 2]).is_none());
    }

    #[test]
    fn test_non_group_has_no_channel_hash() {
        let header = header_byte(PayloadType::RawCustom, RouteType::Flood);
        let bytes = [header, 0x00, 0x01];
        let view = PacketView::parse(&bytes).unwrap();
        assert_eq!(view.payload_type(), PayloadType::RawCustom);
        assert_eq!(view.channel_hash(), None);
    }

    #[test]
    fn test_group_without_payload() {
        let header = header_byte(PayloadType::GrpTxt, RouteType::Flood);
        let bytes = [header, 0x00];
        let view = PacketView::parse(&bytes).unwrap();
        assert_eq!(view.channel_hash(), None);
    }

    #[test]
    fn test_unknown_payload_type() {
        assert_eq!(PayloadType::from(0x0C), PayloadType::Unknown);
        assert!(!PayloadType::Unknown.is_group());
    }
}
