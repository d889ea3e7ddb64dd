//! Provides a parser for BER encoded LDAP messages.
//!
//! Each LDAP message on the wire is a single BER element: a tag, a length and the content. An
//! LDAPMessage is a SEQUENCE which contains the message id (an INTEGER) followed by the
//! protocol operation (tagged with an APPLICATION class tag like `[APPLICATION 0]` for a
//! BindRequest or `[APPLICATION 4]` for a SearchResultEntry) and optional controls.
//!
//! The proxy never interprets requests. It only needs to know where a frame ends (so that it can
//! hash and forward its exact bytes) and, for replies, whether more fragments of the same logical
//! response follow. A search is answered by any number of SearchResultEntry and
//! SearchResultReference messages which are terminated by a SearchResultDone.
//!
//! [Message::parse](Message::parse) inspects the given buffer and either reports a partial
//! frame, a malformed frame or returns the complete message.
//!
//! # Examples
//!
//! Parsing a complete message:
//! ```
//! # use bytes::BytesMut;
//! # use ldapcache::message::Message;
//! // An UnbindRequest (message id 3)...
//! let bytes = BytesMut::from(&[0x30, 0x05, 0x02, 0x01, 0x03, 0x42, 0x00][..]);
//! let message = Message::parse(&bytes).unwrap().unwrap();
//!
//! assert_eq!(message.len(), 7);
//! assert_eq!(message.message_id(), Some(3));
//! assert_eq!(message.protocol_op().unwrap().number, 2);
//! assert_eq!(message.is_continued(), false);
//! ```
//!
//! Parsing a partial message:
//! ```
//! # use bytes::BytesMut;
//! # use ldapcache::message::Message;
//! let bytes = BytesMut::from(&[0x30, 0x05, 0x02, 0x01][..]);
//! assert_eq!(Message::parse(&bytes).unwrap().is_none(), true);
//! ```
//!
//! Parsing a malformed message:
//! ```
//! # use bytes::BytesMut;
//! # use ldapcache::message::Message;
//! // Indefinite lengths are not permitted by LDAP...
//! let bytes = BytesMut::from(&[0x30, 0x80, 0x02, 0x01, 0x03, 0x00, 0x00][..]);
//! assert_eq!(Message::parse(&bytes).is_err(), true);
//! ```
use std::error::Error;
use std::fmt::{Display, Formatter};

use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};

/// Specifies the largest frame we accept from either side.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// The protocol operation tag of a SearchResultEntry.
const SEARCH_RESULT_ENTRY: u32 = 4;

/// The protocol operation tag of a SearchResultReference.
const SEARCH_RESULT_REFERENCE: u32 = 19;

/// Specifies how many octets we accept for the length of an element (4 octets permit up to 4 GiB
/// which is way beyond MAX_FRAME_SIZE anyway).
const MAX_LENGTH_OCTETS: usize = 4;

/// Specifies how many subsequent octets we accept for a tag in high-tag-number form.
const MAX_TAG_OCTETS: usize = 4;

/// Enumerates the errors which can occur when reading frames from a stream.
#[derive(Debug)]
pub enum FrameError {
    /// The stream contained data which is not a valid BER element.
    Malformed(anyhow::Error),

    /// The peer closed the stream in the middle of a frame.
    Truncated,

    /// Reading from the underlying stream failed.
    Io(std::io::Error),
}

impl FrameError {
    fn malformed(message: String) -> FrameError {
        FrameError::Malformed(anyhow!(message))
    }
}

impl From<std::io::Error> for FrameError {
    fn from(error: std::io::Error) -> FrameError {
        FrameError::Io(error)
    }
}

impl Display for FrameError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            FrameError::Malformed(e) => write!(f, "Malformed frame: {}", e),
            FrameError::Truncated => write!(f, "Stream closed in the middle of a frame"),
            FrameError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl Error for FrameError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            FrameError::Io(ref e) => Some(e),
            _ => None,
        }
    }
}

/// Enumerates the four tag classes of BER.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Class {
    /// Types defined by X.690 itself (INTEGER, SEQUENCE, ...).
    Universal,
    /// Used by LDAP to tag its protocol operations.
    Application,
    /// Used for CHOICE alternatives and optional fields.
    ContextSpecific,
    /// Unused by LDAP.
    Private,
}

/// Represents the identifier octets of a BER element.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    /// The class of the tag.
    pub class: Class,

    /// Determines if the content consists of nested elements.
    pub constructed: bool,

    /// The tag number within its class.
    pub number: u32,
}

impl Tag {
    /// The universal INTEGER tag.
    pub const INTEGER: Tag = Tag::universal(false, 2);

    /// The universal SEQUENCE tag.
    pub const SEQUENCE: Tag = Tag::universal(true, 16);

    /// Creates a universal tag.
    pub const fn universal(constructed: bool, number: u32) -> Tag {
        Tag {
            class: Class::Universal,
            constructed,
            number,
        }
    }

    /// Creates an application tag as used for LDAP protocol operations.
    pub const fn application(constructed: bool, number: u32) -> Tag {
        Tag {
            class: Class::Application,
            constructed,
            number,
        }
    }

    fn write(&self, output: &mut BytesMut) {
        let class_bits = match self.class {
            Class::Universal => 0x00,
            Class::Application => 0x40,
            Class::ContextSpecific => 0x80,
            Class::Private => 0xC0,
        };
        let constructed_bit = if self.constructed { 0x20 } else { 0x00 };

        if self.number < 0x1F {
            output.put_u8(class_bits | constructed_bit | self.number as u8);
        } else {
            output.put_u8(class_bits | constructed_bit | 0x1F);
            let mut groups = Vec::new();
            let mut number = self.number;
            loop {
                groups.push((number & 0x7F) as u8);
                number >>= 7;
                if number == 0 {
                    break;
                }
            }
            for (index, group) in groups.iter().enumerate().rev() {
                output.put_u8(if index > 0 { group | 0x80 } else { *group });
            }
        }
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}", self.class, self.number)?;
        if self.constructed {
            write!(f, " (constructed)")?;
        }

        Ok(())
    }
}

/// Describes the position of an element within a byte buffer.
#[derive(Copy, Clone, Debug)]
struct Header {
    tag: Tag,
    header_len: usize,
    content_len: usize,
}

impl Header {
    /// Tries to read the tag and length of the element starting at the beginning of **data**.
    ///
    /// Just like [Message::parse](Message::parse) this returns `Ok(None)` if the header itself
    /// is incomplete.
    fn read(data: &[u8]) -> Result<Option<Header>, FrameError> {
        let first = match data.first() {
            Some(first) => *first,
            None => return Ok(None),
        };

        let class = match first >> 6 {
            0 => Class::Universal,
            1 => Class::Application,
            2 => Class::ContextSpecific,
            _ => Class::Private,
        };
        let constructed = first & 0x20 != 0;
        let mut number = (first & 0x1F) as u32;
        let mut offset = 1;

        // High-tag-number form: the number follows in base 128, the last octet has bit 8 cleared...
        if number == 0x1F {
            number = 0;
            loop {
                let octet = match data.get(offset) {
                    Some(octet) => *octet,
                    None => return Ok(None),
                };
                offset += 1;
                if offset - 1 > MAX_TAG_OCTETS {
                    return Err(FrameError::malformed(format!(
                        "Tag number exceeds {} octets",
                        MAX_TAG_OCTETS
                    )));
                }

                number = (number << 7) | (octet & 0x7F) as u32;
                if octet & 0x80 == 0 {
                    break;
                }
            }
        }

        let length_octet = match data.get(offset) {
            Some(octet) => *octet,
            None => return Ok(None),
        };
        offset += 1;

        let content_len = if length_octet & 0x80 == 0 {
            length_octet as usize
        } else {
            let num_octets = (length_octet & 0x7F) as usize;
            if num_octets == 0 {
                return Err(FrameError::malformed(
                    "Indefinite lengths are not permitted".to_owned(),
                ));
            }
            if num_octets > MAX_LENGTH_OCTETS {
                return Err(FrameError::malformed(format!(
                    "Length field of {} octets at position {} is too large",
                    num_octets,
                    offset - 1
                )));
            }
            if data.len() < offset + num_octets {
                return Ok(None);
            }

            let length = data[offset..offset + num_octets]
                .iter()
                .fold(0usize, |length, octet| (length << 8) | *octet as usize);
            offset += num_octets;
            length
        };

        if content_len > MAX_FRAME_SIZE {
            return Err(FrameError::malformed(format!(
                "Element of {} bytes exceeds the maximal frame size",
                content_len
            )));
        }

        Ok(Some(Header {
            tag: Tag {
                class,
                constructed,
                number,
            },
            header_len: offset,
            content_len,
        }))
    }

    fn total_len(&self) -> usize {
        self.header_len + self.content_len
    }
}

/// Represents a nested element of a message.
#[derive(Clone, Debug)]
pub struct Element {
    tag: Tag,
    content: Bytes,
}

impl Element {
    /// Returns the tag of this element.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Returns the content octets (without tag and length).
    pub fn content(&self) -> &[u8] {
        &self.content
    }
}

/// Represents a complete framed message along with its exact wire bytes.
///
/// Messages are only ever created by [Message::parse](Message::parse) (or
/// [Message::example](Message::example)), therefore the raw bytes are always exactly one
/// complete BER element.
#[derive(Clone, Debug)]
pub struct Message {
    data: Bytes,
    header: Header,
}

impl Message {
    /// Tries to parse a message from the beginning of the given buffer.
    ///
    /// If malformed data is detected, we return an **Err**. Otherwise we either return an
    /// empty optional in case only a partial message is present or the complete message.
    /// Note that trailing bytes (which belong to the next frame) are ignored.
    ///
    /// The frame is copied out of the buffer so that messages which end up in the cache do not
    /// pin the receive buffer of a connection.
    ///
    /// # Examples
    ///
    /// ```
    /// # use bytes::BytesMut;
    /// # use ldapcache::message::Message;
    /// let mut bytes = BytesMut::from(Message::example(7, 0, b"bind").raw().as_ref());
    /// bytes.extend_from_slice(&[0x30, 0x03]);
    ///
    /// let message = Message::parse(&bytes).unwrap().unwrap();
    /// assert_eq!(message.len(), bytes.len() - 2);
    /// assert_eq!(message.message_id(), Some(7));
    /// ```
    pub fn parse(data: &BytesMut) -> Result<Option<Message>, FrameError> {
        let header = match Header::read(data)? {
            Some(header) => header,
            None => return Ok(None),
        };

        if data.len() < header.total_len() {
            Ok(None)
        } else {
            Ok(Some(Message {
                data: Bytes::copy_from_slice(&data[..header.total_len()]),
                header,
            }))
        }
    }

    /// Builds an LDAPMessage with the given id and protocol operation.
    ///
    /// The operation is encoded as constructed `[APPLICATION op]` element which contains
    /// **payload** as a single OCTET STRING. This is mostly intended for tests and examples.
    ///
    /// # Example
    /// ```
    /// # use ldapcache::message::Message;
    /// let entry = Message::example(2, 4, b"cn=test");
    /// assert_eq!(entry.is_continued(), true);
    ///
    /// let done = Message::example(2, 5, b"");
    /// assert_eq!(done.is_continued(), false);
    /// ```
    pub fn example(message_id: i32, op: u32, payload: &[u8]) -> Message {
        let mut operation = BytesMut::new();
        write_element(&mut operation, Tag::universal(false, 4), payload);

        let mut content = BytesMut::new();
        write_element(&mut content, Tag::INTEGER, &encode_integer(message_id));
        write_element(&mut content, Tag::application(true, op), &operation);

        let mut data = BytesMut::new();
        write_element(&mut data, Tag::SEQUENCE, &content);

        let header = Header {
            tag: Tag::SEQUENCE,
            header_len: data.len() - content.len(),
            content_len: content.len(),
        };

        Message {
            data: data.freeze(),
            header,
        }
    }

    /// Returns the exact wire bytes of this message.
    pub fn raw(&self) -> &Bytes {
        &self.data
    }

    /// Returns the total length of this message in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns the tag of the outermost element (a SEQUENCE for all valid LDAP messages).
    pub fn tag(&self) -> Tag {
        self.header.tag
    }

    /// Parses the immediate children of this message.
    ///
    /// Returns an empty list for primitive elements and an **Err** if the content isn't a valid
    /// series of BER elements.
    pub fn children(&self) -> Result<Vec<Element>, FrameError> {
        let mut result = Vec::new();
        if !self.header.tag.constructed {
            return Ok(result);
        }

        let content = self.data.slice(self.header.header_len..);
        let mut offset = 0;
        while offset < content.len() {
            let header = match Header::read(&content[offset..])? {
                Some(header) if offset + header.total_len() <= content.len() => header,
                _ => {
                    return Err(FrameError::malformed(format!(
                        "Nested element at offset {} exceeds its enclosing message",
                        offset
                    )))
                }
            };

            result.push(Element {
                tag: header.tag,
                content: content.slice(offset + header.header_len..offset + header.total_len()),
            });
            offset += header.total_len();
        }

        Ok(result)
    }

    /// Returns the message id of this LDAP message if present and valid.
    pub fn message_id(&self) -> Option<i64> {
        let children = self.children().ok()?;
        let id = children.first().filter(|child| child.tag == Tag::INTEGER)?;
        decode_integer(id.content())
    }

    /// Returns the tag of the protocol operation (the second element within the message).
    pub fn protocol_op(&self) -> Option<Tag> {
        self.children()
            .ok()
            .and_then(|children| children.get(1).map(|child| child.tag))
    }

    /// Determines if more fragments of the same logical reply follow this message.
    ///
    /// This is the case for every SearchResultEntry and SearchResultReference, as a search
    /// is only completed by its SearchResultDone.
    pub fn is_continued(&self) -> bool {
        matches!(
            self.protocol_op(),
            Some(Tag {
                class: Class::Application,
                number: SEARCH_RESULT_ENTRY | SEARCH_RESULT_REFERENCE,
                ..
            })
        )
    }
}

fn write_element(output: &mut BytesMut, tag: Tag, content: &[u8]) {
    tag.write(output);

    let len = content.len();
    if len < 0x80 {
        output.put_u8(len as u8);
    } else {
        let octets = len.to_be_bytes();
        let skip = octets.iter().take_while(|octet| **octet == 0).count();
        output.put_u8(0x80 | (octets.len() - skip) as u8);
        output.put_slice(&octets[skip..]);
    }

    output.put_slice(content);
}

fn encode_integer(value: i32) -> Vec<u8> {
    let mut octets = value.to_be_bytes().to_vec();

    // Strip redundant leading octets while keeping the sign bit intact...
    while octets.len() > 1
        && ((octets[0] == 0x00 && octets[1] & 0x80 == 0)
            || (octets[0] == 0xFF && octets[1] & 0x80 != 0))
    {
        let _ = octets.remove(0);
    }

    octets
}

fn decode_integer(content: &[u8]) -> Option<i64> {
    if content.is_empty() || content.len() > 8 {
        return None;
    }

    let initial: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    Some(
        content
            .iter()
            .fold(initial, |value, octet| (value << 8) | *octet as i64),
    )
}

#[cfg(test)]
mod tests {
    use crate::message::{Class, FrameError, Message, Tag};
    use bytes::BytesMut;

    #[test]
    fn a_bind_request_is_successfully_parsed() {
        // BindRequest, message id 1, version 3, name "", simple auth ""
        let data = [
            0x30, 0x0C, 0x02, 0x01, 0x01, 0x60, 0x07, 0x02, 0x01, 0x03, 0x04, 0x00, 0x80, 0x00,
        ];
        let message = Message::parse(&BytesMut::from(&data[..]))
            .unwrap()
            .unwrap();

        assert_eq!(message.len(), data.len());
        assert_eq!(message.raw().as_ref(), &data[..]);
        assert_eq!(message.tag(), Tag::SEQUENCE);
        assert_eq!(message.message_id(), Some(1));
        assert_eq!(message.protocol_op(), Some(Tag::application(true, 0)));
        assert_eq!(message.is_continued(), false);
        assert_eq!(message.children().unwrap().len(), 2);
    }

    #[test]
    fn search_results_are_detected_as_continued() {
        assert_eq!(Message::example(1, 4, b"entry").is_continued(), true);
        assert_eq!(Message::example(1, 19, b"ldap://other").is_continued(), true);
        assert_eq!(Message::example(1, 5, b"").is_continued(), false);
        assert_eq!(Message::example(1, 1, b"").is_continued(), false);
    }

    #[test]
    fn a_message_without_operation_is_not_continued() {
        let data = [0x30, 0x03, 0x02, 0x01, 0x05];
        let message = Message::parse(&BytesMut::from(&data[..]))
            .unwrap()
            .unwrap();
        assert_eq!(message.protocol_op(), None);
        assert_eq!(message.is_continued(), false);
    }

    #[test]
    fn long_form_lengths_are_supported() {
        let payload = vec![b'x'; 1000];
        let example = Message::example(300, 4, &payload);
        let message = Message::parse(&BytesMut::from(example.raw().as_ref()))
            .unwrap()
            .unwrap();

        assert_eq!(message.len(), example.len());
        assert_eq!(message.message_id(), Some(300));
        assert_eq!(message.children().unwrap()[1].content().len(), 1000 + 4);
    }

    #[test]
    fn high_tag_numbers_are_supported() {
        let example = Message::example(1, 42, b"x");
        let message = Message::parse(&BytesMut::from(example.raw().as_ref()))
            .unwrap()
            .unwrap();
        assert_eq!(
            message.protocol_op(),
            Some(Tag {
                class: Class::Application,
                constructed: true,
                number: 42
            })
        );
    }

    #[test]
    fn negative_message_ids_are_decoded() {
        assert_eq!(Message::example(-2, 1, b"").message_id(), Some(-2));
        assert_eq!(Message::example(128, 1, b"").message_id(), Some(128));
    }

    #[test]
    fn an_incomplete_message_is_skipped() {
        let data = Message::example(1, 3, b"search").raw().clone();
        for len in 0..data.len() {
            let result = Message::parse(&BytesMut::from(&data[..len])).unwrap();
            assert_eq!(result.is_none(), true);
        }
    }

    #[test]
    fn malformed_lengths_are_detected() {
        // Indefinite length...
        assert!(matches!(
            Message::parse(&BytesMut::from(&[0x30, 0x80][..])),
            Err(FrameError::Malformed(_))
        ));

        // A length field with 5 octets...
        assert!(matches!(
            Message::parse(&BytesMut::from(&[0x30, 0x85, 0x01, 0x00, 0x00, 0x00, 0x00][..])),
            Err(FrameError::Malformed(_))
        ));

        // A length beyond the frame limit...
        assert!(matches!(
            Message::parse(&BytesMut::from(&[0x30, 0x84, 0x7F, 0xFF, 0xFF, 0xFF][..])),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn overlong_children_are_detected() {
        // The INTEGER claims 5 bytes but the SEQUENCE only contains 3...
        let data = [0x30, 0x03, 0x02, 0x05, 0x01];
        let message = Message::parse(&BytesMut::from(&data[..]))
            .unwrap()
            .unwrap();
        assert_eq!(message.children().is_err(), true);
        assert_eq!(message.message_id(), None);
    }
}
