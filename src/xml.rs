//! Minimal XML tree used by the section and world file formats.
//!
//! The formats are small and attribute-heavy, so files are parsed into a
//! plain element tree with quick-xml and written back with a simple indenting
//! serializer. Text content is ignored; the formats carry no mixed content.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{MapError, MapResult};

/// One XML element: name, attributes in document order, child elements.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    /// Builder-style attribute append.
    pub fn with_attr(mut self, name: &str, value: impl ToString) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn push(&mut self, child: XmlNode) {
        self.children.push(child);
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn require_attr(&self, name: &str) -> MapResult<&str> {
        self.attr(name).ok_or_else(|| {
            MapError::Parse(format!("element <{}> missing attribute '{}'", self.name, name))
        })
    }

    /// Parse a required attribute into any `FromStr` type.
    pub fn parse_attr<T: FromStr>(&self, name: &str) -> MapResult<T> {
        let text = self.require_attr(name)?;
        text.parse().map_err(|_| {
            MapError::Parse(format!("attribute {}='{}' on <{}> is malformed", name, text, self.name))
        })
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    // -------------------------------------------------------------------------
    // PARSING
    // -------------------------------------------------------------------------

    /// Parse a document from a string; returns the root element.
    pub fn parse_str(xml: &str) -> MapResult<XmlNode> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<XmlNode> = Vec::new();
        let mut root: Option<XmlNode> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let node = element_from_start(e.name().as_ref(), e.attributes())?;
                    stack.push(node);
                }
                Event::Empty(e) => {
                    let node = element_from_start(e.name().as_ref(), e.attributes())?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::End(_) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| MapError::Parse("unbalanced end tag".into()))?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::Eof => break,
                // declarations, comments, whitespace text
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(MapError::Parse("unclosed element at end of document".into()));
        }
        root.ok_or_else(|| MapError::Parse("document has no root element".into()))
    }

    pub fn read_file(path: &Path) -> MapResult<XmlNode> {
        let text = fs::read_to_string(path)?;
        Self::parse_str(&text)
    }

    // -------------------------------------------------------------------------
    // WRITING
    // -------------------------------------------------------------------------

    /// Serialize this element as an indented document.
    pub fn to_document(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        self.write_into(&mut out, 0);
        out
    }

    pub fn write_file(&self, path: &Path) -> MapResult<()> {
        fs::write(path, self.to_document())?;
        Ok(())
    }

    fn write_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = write!(out, "{}<{}", indent, self.name);
        for (k, v) in &self.attrs {
            let _ = write!(out, " {}=\"{}\"", k, escape(v));
        }
        if self.children.is_empty() {
            out.push_str(" />\n");
        } else {
            out.push_str(">\n");
            for child in &self.children {
                child.write_into(out, depth + 1);
            }
            let _ = writeln!(out, "{}</{}>", indent, self.name);
        }
    }
}

fn attach(stack: &mut [XmlNode], root: &mut Option<XmlNode>, node: XmlNode) -> MapResult<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    } else if root.is_none() {
        *root = Some(node);
    } else {
        return Err(MapError::Parse("multiple root elements".into()));
    }
    Ok(())
}

fn element_from_start(
    name: &[u8],
    attrs: quick_xml::events::attributes::Attributes<'_>,
) -> MapResult<XmlNode> {
    let mut node = XmlNode::new(&String::from_utf8_lossy(name));
    for attr in attrs {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = unescape(&String::from_utf8_lossy(attr.value.as_ref()));
        node.attrs.push((key, value));
    }
    Ok(node)
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // Raw control characters in attribute values get
            // whitespace-normalized by conforming parsers
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "&#{};", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest.find(';') else {
            break;
        };
        let decoded = match &rest[1..end] {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "amp" => Some('&'),
            entity => entity
                .strip_prefix('#')
                .and_then(|num| match num.strip_prefix('x') {
                    Some(hex) => u32::from_str_radix(hex, 16).ok(),
                    None => num.parse().ok(),
                })
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
