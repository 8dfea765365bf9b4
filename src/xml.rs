//! Minimal XML plumbing on top of quick-xml: a namespaced writer used by the
//! document builder and envelope, and a small element tree for reading responses
//! and submitted documents back.

use crate::error::{VerifactuError, VerifactuResult};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

fn codec_error(err: impl std::fmt::Display) -> VerifactuError {
    VerifactuError::MalformedDocument(err.to_string())
}

/// Compact writer, no indentation, so output bytes are stable.
pub struct XmlOut {
    writer: Writer<Vec<u8>>,
}

impl Default for XmlOut {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlOut {
    pub fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }

    pub fn open(&mut self, name: &str) -> VerifactuResult<&mut Self> {
        self.open_with(name, &[])
    }

    pub fn open_with(&mut self, name: &str, attrs: &[(&str, &str)]) -> VerifactuResult<&mut Self> {
        let mut start = BytesStart::new(name);
        for attr in attrs {
            start.push_attribute(*attr);
        }
        self.writer
            .write_event(Event::Start(start))
            .map_err(codec_error)?;
        Ok(self)
    }

    pub fn empty_with(&mut self, name: &str, attrs: &[(&str, &str)]) -> VerifactuResult<&mut Self> {
        let mut start = BytesStart::new(name);
        for attr in attrs {
            start.push_attribute(*attr);
        }
        self.writer
            .write_event(Event::Empty(start))
            .map_err(codec_error)?;
        Ok(self)
    }

    pub fn close(&mut self, name: &str) -> VerifactuResult<&mut Self> {
        self.writer
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(codec_error)?;
        Ok(self)
    }

    /// `<name>text</name>` with the text escaped.
    pub fn leaf(&mut self, name: &str, text: &str) -> VerifactuResult<&mut Self> {
        self.open(name)?;
        self.writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(codec_error)?;
        self.close(name)
    }

    pub fn leaf_opt(&mut self, name: &str, text: Option<&str>) -> VerifactuResult<&mut Self> {
        match text {
            Some(text) => self.leaf(name, text),
            None => Ok(self),
        }
    }

    /// Appends already serialized markup untouched.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.writer.get_mut().extend_from_slice(bytes);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.writer.into_inner()
    }
}

/// Element with its namespace prefix stripped from the name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub text: String,
}

impl XmlNode {
    pub fn parse(input: &[u8]) -> VerifactuResult<XmlNode> {
        let text = std::str::from_utf8(input).map_err(codec_error)?;
        let mut reader = Reader::from_str(text);
        let mut stack: Vec<XmlNode> = vec![];
        let mut root: Option<XmlNode> = None;

        loop {
            match reader.read_event().map_err(codec_error)? {
                Event::Start(start) => stack.push(node_from_start(&start)?),
                Event::Empty(start) => {
                    let node = node_from_start(&start)?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::End(_) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| codec_error("closing tag without opening tag"))?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::Text(t) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&t.unescape().map_err(codec_error)?);
                    }
                }
                Event::CData(c) => {
                    if let Some(current) = stack.last_mut() {
                        current
                            .text
                            .push_str(&String::from_utf8_lossy(&c.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(codec_error("unclosed element at end of input"));
        }
        root.ok_or_else(|| codec_error("document has no root element"))
    }

    /// First descendant (or self) with the given local name, depth first.
    pub fn find(&self, name: &str) -> Option<&XmlNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }

    pub fn find_all<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlNode>) {
        if self.name == name {
            out.push(self);
        }
        for child in &self.children {
            child.find_all(name, out);
        }
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Trimmed text of the first descendant named `name`, if not blank.
    pub fn find_text(&self, name: &str) -> Option<&str> {
        self.find(name)
            .map(|n| n.text.trim())
            .filter(|t| !t.is_empty())
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Leaf values keyed by their slash separated path below this node,
    /// skipping any subtree named in `skip`.
    pub fn leaf_paths(&self, skip: &[&str]) -> Vec<(String, String)> {
        let mut out = vec![];
        self.collect_leaves(&self.name, skip, &mut out);
        out
    }

    fn collect_leaves(&self, path: &str, skip: &[&str], out: &mut Vec<(String, String)>) {
        if self.children.is_empty() {
            out.push((path.to_string(), self.text.trim().to_string()));
            return;
        }
        for child in &self.children {
            if skip.contains(&child.name.as_str()) {
                continue;
            }
            child.collect_leaves(&format!("{path}/{}", child.name), skip, out);
        }
    }
}

fn local(name: &[u8]) -> VerifactuResult<String> {
    std::str::from_utf8(name)
        .map(str::to_string)
        .map_err(codec_error)
}

fn node_from_start(start: &BytesStart<'_>) -> VerifactuResult<XmlNode> {
    let mut node = XmlNode {
        name: local(start.local_name().as_ref())?,
        ..XmlNode::default()
    };
    for attr in start.attributes() {
        let attr = attr.map_err(codec_error)?;
        let key = local(attr.key.as_ref())?;
        let value = attr.unescape_value().map_err(codec_error)?.into_owned();
        node.attributes.push((key, value));
    }
    Ok(node)
}

fn attach(
    stack: &mut [XmlNode],
    root: &mut Option<XmlNode>,
    node: XmlNode,
) -> VerifactuResult<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => return Err(codec_error("more than one root element")),
    }
    Ok(())
}

/// Local name of the root element of a serialized document.
pub fn root_name(input: &[u8]) -> VerifactuResult<String> {
    let text = std::str::from_utf8(input).map_err(codec_error)?;
    let mut reader = Reader::from_str(text);
    loop {
        match reader.read_event().map_err(codec_error)? {
            Event::Start(start) | Event::Empty(start) => {
                return local(start.local_name().as_ref());
            }
            Event::Eof => return Err(codec_error("document has no root element")),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_escapes_text_and_stays_compact() {
        let mut out = XmlOut::new();
        out.open_with("a:Root", &[("xmlns:a", "urn:x")])
            .unwrap()
            .leaf("a:Name", "Smith & Sons <SL>")
            .unwrap()
            .empty_with("a:Flag", &[("v", "1")])
            .unwrap()
            .close("a:Root")
            .unwrap();
        let xml = String::from_utf8(out.into_bytes()).unwrap();
        assert_eq!(
            xml,
            r#"<a:Root xmlns:a="urn:x"><a:Name>Smith &amp; Sons &lt;SL&gt;</a:Name><a:Flag v="1"/></a:Root>"#
        );
    }

    #[test]
    fn parse_strips_prefixes_and_unescapes() {
        let doc = br#"<?xml version="1.0"?><s:Env xmlns:s="urn:s"><s:Body><r:Estado xmlns:r="urn:r"> Correcto </r:Estado><r:Desc>a &amp; b</r:Desc></s:Body></s:Env>"#;
        let root = XmlNode::parse(doc).unwrap();
        assert_eq!(root.name, "Env");
        assert_eq!(root.find_text("Estado"), Some("Correcto"));
        assert_eq!(root.find_text("Desc"), Some("a & b"));
        assert!(root.find("Missing").is_none());
    }

    #[test]
    fn parse_rejects_broken_documents() {
        assert!(XmlNode::parse(b"<a><b></a>").is_err());
        assert!(XmlNode::parse(b"plain text").is_err());
        assert!(XmlNode::parse(b"<a/><b/>").is_err());
    }

    #[test]
    fn leaf_paths_skip_subtrees() {
        let root = XmlNode::parse(b"<R><A>1</A><Sig><V>x</V></Sig><B><C>2</C></B></R>").unwrap();
        assert_eq!(
            root.leaf_paths(&["Sig"]),
            vec![
                ("R/A".to_string(), "1".to_string()),
                ("R/B/C".to_string(), "2".to_string())
            ]
        );
    }

    #[test]
    fn root_name_reads_first_element() {
        assert_eq!(
            root_name(br#"<sum1:RegistroAlta xmlns:sum1="urn:x"><x/></sum1:RegistroAlta>"#).unwrap(),
            "RegistroAlta"
        );
    }
}
