//! Generic element tree for the probe tool's XML output.
//!
//! The tree knows nothing about the probe schema; the projection into typed
//! findings lives in [`crate::parser`]. Building the tree is total: any
//! input either yields a tree or a [`ParseError`].

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::error::ParseError;

/// Deepest nesting accepted. nmap output stays well under 20.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    /// Concatenated, trimmed text content directly under this element.
    pub text: String,
    pub children: Vec<Node>,
}

impl Node {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// First child element `name` whose `key` attribute equals `key`
    /// (the `<table key="..">` / `<elem key="..">` shape).
    pub fn keyed(&self, name: &str, key: &str) -> Option<&Node> {
        self.children
            .iter()
            .find(|c| c.name == name && c.attr("key") == Some(key))
    }
}

/// Parse a complete XML document into its root element.
pub fn parse_document(raw: &str) -> Result<Node, ParseError> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            ParseError::new(
                format!("malformed XML at byte {}: {e}", reader.buffer_position()),
                raw,
            )
        })?;
        match event {
            Event::Start(start) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(ParseError::new(
                        format!("element nesting deeper than {MAX_DEPTH}"),
                        raw,
                    ));
                }
                stack.push(open_node(&start, raw)?);
            }
            Event::Empty(start) => {
                let node = open_node(&start, raw)?;
                close_node(node, &mut stack, &mut root, raw)?;
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| ParseError::new("closing tag without opening tag", raw))?;
                close_node(node, &mut stack, &mut root, raw)?;
            }
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map_err(|e| ParseError::new(format!("bad text content: {e}"), raw))?;
                append_text(&mut stack, &value, raw)?;
            }
            Event::CData(data) => {
                let value = String::from_utf8_lossy(&data).into_owned();
                append_text(&mut stack, &value, raw)?;
            }
            Event::Eof => break,
            // Declarations, comments, doctype, processing instructions.
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ParseError::new(
            format!("document ends inside <{}>", stack[stack.len() - 1].name),
            raw,
        ));
    }
    root.ok_or_else(|| ParseError::new("document has no root element", raw))
}

fn open_node(start: &BytesStart<'_>, raw: &str) -> Result<Node, ParseError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ParseError::new(format!("bad attribute in <{name}>: {e}"), raw))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| ParseError::new(format!("bad attribute value in <{name}>: {e}"), raw))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(Node {
        name,
        attrs,
        ..Node::default()
    })
}

fn close_node(
    node: Node,
    stack: &mut [Node],
    root: &mut Option<Node>,
    raw: &str,
) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_some() => {
            return Err(ParseError::new(
                format!("second root element <{}>", node.name),
                raw,
            ))
        }
        None => *root = Some(node),
    }
    Ok(())
}

fn append_text(stack: &mut [Node], value: &str, raw: &str) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(node) => {
            node.text.push_str(value);
            Ok(())
        }
        None if value.trim().is_empty() => Ok(()),
        None => Err(ParseError::new("text outside the root element", raw)),
    }
}
