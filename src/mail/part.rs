use mail_parser::decoders::base64::base64_decode;
use mail_parser::decoders::quoted_printable::quoted_printable_decode;
use mail_parser::{
    Address, Header, HeaderName, HeaderValue, Message, MessageParser, MimeHeaders, PartType,
};
use std::collections::HashMap;

/// One node of a message's MIME tree. A part with children but no content
/// is a pure container (multipart); a part with a filename is an
/// attachment.
#[derive(Debug, Clone)]
pub struct Part {
    pub content_type: String,
    pub filename: Option<String>,
    pub content: Vec<u8>,
    /// Index of the parent node, `None` for the root.
    pub parent: Option<usize>,
    /// Indices of child nodes, in source encoding order.
    pub children: Vec<usize>,
}

impl Part {
    pub fn is_attachment(&self) -> bool {
        self.filename.is_some()
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// The MIME tree of one message, arena-backed so children own nothing and
/// parent links are plain indices. Node 0 is the root.
#[derive(Debug, Clone, Default)]
pub struct PartTree {
    nodes: Vec<Part>,
}

impl PartTree {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> Option<&Part> {
        self.nodes.first()
    }

    pub fn get(&self, idx: usize) -> Option<&Part> {
        self.nodes.get(idx)
    }

    pub fn parent_of(&self, idx: usize) -> Option<&Part> {
        self.nodes.get(idx)?.parent.map(|p| &self.nodes[p])
    }

    pub fn children_of(&self, idx: usize) -> impl Iterator<Item = &Part> {
        self.nodes
            .get(idx)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|&c| &self.nodes[c])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Part> {
        self.nodes.iter()
    }

    /// Every part carrying a filename, depth-first.
    pub fn attachments(&self) -> Vec<&Part> {
        self.nodes.iter().filter(|p| p.is_attachment()).collect()
    }
}

/// Headers plus part tree, as cached on a message.
#[derive(Debug, Clone, Default)]
pub struct ParsedMail {
    /// Lower-cased header name -> decoded value; duplicate names keep the
    /// last occurrence.
    pub headers: HashMap<String, String>,
    pub parts: PartTree,
}

/// Parse raw message bytes into headers and a part tree.
///
/// If the initial parse fails, skip forward past two newlines (scanning at
/// most 1024 bytes) and retry once from that offset; malformed messages
/// sometimes carry a junk preamble before the real header block. Returns
/// `None` when both attempts fail.
pub(crate) fn parse_bytes(buf: &[u8], convert_charsets: bool) -> Option<ParsedMail> {
    if let Some(message) = try_parse(buf) {
        return Some(build(&message, buf, convert_charsets));
    }

    let mut newlines = 2;
    let mut offset = 0;
    while newlines > 0 && offset < 1024 && offset < buf.len() {
        if buf[offset] == b'\n' {
            newlines -= 1;
        }
        offset += 1;
    }

    let rest = &buf[offset..];
    try_parse(rest).map(|m| build(&m, rest, convert_charsets))
}

/// A parse that produced no header block at all is treated as a failure;
/// the lenient parser would otherwise swallow a junk preamble as an empty
/// message.
fn try_parse(buf: &[u8]) -> Option<Message<'_>> {
    MessageParser::default()
        .parse(buf)
        .filter(|m| m.parts.first().is_some_and(|root| !root.headers.is_empty()))
}

fn build(message: &Message, raw: &[u8], convert_charsets: bool) -> ParsedMail {
    let mut headers = HashMap::new();

    if let Some(root) = message.parts.first() {
        for header in &root.headers {
            let name = header.name.as_str().to_lowercase();
            headers.insert(name, header_text(raw, header));
        }
    }

    let mut nodes = Vec::new();
    if !message.parts.is_empty() {
        add_part(&mut nodes, message, raw, 0, None, convert_charsets);
    }

    ParsedMail {
        headers,
        parts: PartTree { nodes },
    }
}

/// Convert one parsed part (and, for multiparts, its subtree) into arena
/// nodes, returning the new node's index.
fn add_part(
    nodes: &mut Vec<Part>,
    message: &Message,
    raw: &[u8],
    part_id: usize,
    parent: Option<usize>,
    convert_charsets: bool,
) -> usize {
    let part = &message.parts[part_id];

    let content_type = match part.content_type() {
        Some(ct) => match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub),
            None => ct.ctype().to_string(),
        },
        None => "text/plain".to_string(),
    };

    // Content-Disposition filename wins over the Content-Type name
    // parameter; mail-parser checks them in that order.
    let filename = part.attachment_name().map(|s| s.to_string());

    let content = match &part.body {
        // Pure container, no bytes of its own.
        PartType::Multipart(_) => Vec::new(),
        // Encapsulated message: keep the serialized form, do not recurse.
        PartType::Message(sub) => sub.raw_message.to_vec(),
        _ => leaf_content(message, raw, part_id, convert_charsets),
    };

    let idx = nodes.len();
    nodes.push(Part {
        content_type,
        filename,
        content,
        parent,
        children: Vec::new(),
    });

    if let PartType::Multipart(kids) = &message.parts[part_id].body {
        for &kid in kids {
            let child = add_part(nodes, message, raw, kid, Some(idx), convert_charsets);
            nodes[idx].children.push(child);
        }
    }

    idx
}

/// Transfer-decode a leaf part's body from the raw message, applying
/// charset conversion only when enabled, the part is text/plain, and a
/// non-UTF-8 charset is declared.
fn leaf_content(message: &Message, raw: &[u8], part_id: usize, convert_charsets: bool) -> Vec<u8> {
    let part = &message.parts[part_id];
    let encoded = raw
        .get(part.offset_body..part.offset_end)
        .unwrap_or_default();

    let mut data = match transfer_encoding(part.headers.as_slice()).as_deref() {
        Some("base64") => base64_decode(encoded).unwrap_or_else(|| encoded.to_vec()),
        Some("quoted-printable") => {
            quoted_printable_decode(encoded).unwrap_or_else(|| encoded.to_vec())
        }
        _ => encoded.to_vec(),
    };

    if convert_charsets {
        if let Some(ct) = part.content_type() {
            let is_text_plain = ct.ctype().eq_ignore_ascii_case("text")
                && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case("plain"));
            let charset = ct.attribute("charset");

            if is_text_plain {
                if let Some(charset) = charset {
                    if !charset.eq_ignore_ascii_case("utf-8") {
                        data = convert_to_utf8(data, charset);
                    }
                }
            }
        }
    }

    data
}

/// Decode `data` from `charset` to UTF-8; a failed or lossy conversion
/// leaves the original bytes untouched.
fn convert_to_utf8(data: Vec<u8>, charset: &str) -> Vec<u8> {
    match encoding_rs::Encoding::for_label(charset.as_bytes()) {
        Some(encoding) => {
            let (converted, _, had_errors) = encoding.decode(&data);
            if had_errors {
                data
            } else {
                converted.into_owned().into_bytes()
            }
        }
        None => data,
    }
}

fn transfer_encoding(headers: &[Header]) -> Option<String> {
    headers
        .iter()
        .filter(|h| h.name == HeaderName::ContentTransferEncoding)
        .last()
        .and_then(|h| h.value.as_text())
        .map(|v| v.trim().to_lowercase())
}

/// The decoded, display-ready text of one header. RFC 2047 encoded-words
/// are already unfolded by the parser for textual values; anything the
/// parser turned into a structured value is re-rendered as text.
fn header_text(raw: &[u8], header: &Header) -> String {
    match &header.value {
        HeaderValue::Text(t) => t.to_string(),
        HeaderValue::TextList(list) => list.join(" "),
        HeaderValue::Address(addr) => format_address(addr),
        _ => String::from_utf8_lossy(
            raw.get(header.offset_start..header.offset_end)
                .unwrap_or_default(),
        )
        .trim()
        .to_string(),
    }
}

fn format_address(addr: &Address) -> String {
    fn one(a: &mail_parser::Addr) -> String {
        let email = a.address.as_deref().unwrap_or("");
        match a.name.as_deref() {
            Some(name) => format!("{} <{}>", name, email),
            None => email.to_string(),
        }
    }

    match addr {
        Address::List(list) => list.iter().map(one).collect::<Vec<_>>().join(", "),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter())
            .map(one)
            .collect::<Vec<_>>()
            .join(", "),
    }
}
