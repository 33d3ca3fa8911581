//! Parse a delivered record fragment into an element tree, and flatten that
//! tree into a `RawRecord`.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use stitcher_common::{RawRecord, Result, StitchError};

/// One XML element with its attributes, text and children, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Flatten into a record.
    ///
    /// The root's attributes become `@name` fields. Leaf children become
    /// fields named after the element (their attributes `element@name`);
    /// nested children are flattened with a `parent/child` path. Repeated
    /// names accumulate into lists.
    pub fn to_record(&self) -> RawRecord {
        let mut record = RawRecord::new();
        for (k, v) in &self.attributes {
            record.push(format!("@{k}"), v.as_str());
        }
        let text = self.text.trim();
        if !text.is_empty() {
            record.push("#text", text);
        }
        for child in &self.children {
            flatten(child, "", &mut record);
        }
        record
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| StitchError::Xml(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| StitchError::Xml(e.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self { name, attributes, ..Default::default() })
    }
}

fn flatten(element: &XmlElement, prefix: &str, record: &mut RawRecord) {
    let path = format!("{prefix}{}", element.name);
    for (k, v) in &element.attributes {
        record.push(format!("{path}@{k}"), v.as_str());
    }
    if element.is_leaf() {
        let text = element.text.trim();
        if !text.is_empty() {
            record.push(path, text);
        }
        return;
    }
    let nested = format!("{path}/");
    for child in &element.children {
        flatten(child, &nested, record);
    }
}

/// Parse one fragment as delivered by `XmlStream` (declaration included).
pub fn parse_fragment(bytes: &[u8]) -> Result<XmlElement> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => stack.push(XmlElement::from_start(e)?),
            Ok(Event::Empty(ref e)) => {
                let element = XmlElement::from_start(e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|e| StitchError::Xml(e.to_string()))?;
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(ref e)) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&**e));
                }
            }
            Ok(Event::End(_)) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| StitchError::Xml("unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(StitchError::Xml(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(StitchError::Xml(format!("{} unclosed element(s)", stack.len())));
    }
    root.ok_or_else(|| StitchError::Xml("no root element".to_string()))
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(StitchError::Xml("more than one root element".to_string())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stitcher_common::Value;

    const FRAGMENT: &str = r#"<?xml version="1.0"?>
<GTRLabTest id="12" version="3">
  <name>BRCA1 panel</name>
  <xref db="MeSH">D001943</xref>
  <xref db="OMIM">113705</xref>
  <lab><name>Acme Labs</name><country>US</country></lab>
  <flag/>
</GTRLabTest>"#;

    #[test]
    fn test_parse_tree() {
        let root = parse_fragment(FRAGMENT.as_bytes()).unwrap();
        assert_eq!(root.name, "GTRLabTest");
        assert_eq!(root.attr("id"), Some("12"));
        assert_eq!(root.children.len(), 5);
        assert_eq!(root.children_named("xref").count(), 2);
        assert_eq!(root.child("lab").unwrap().child("country").unwrap().text, "US");
    }

    #[test]
    fn test_to_record_flattens() {
        let record = parse_fragment(FRAGMENT.as_bytes()).unwrap().to_record();
        assert_eq!(record.get("@id"), Some(&Value::from("12")));
        assert_eq!(record.get("name"), Some(&Value::from("BRCA1 panel")));
        assert_eq!(record.get("xref"), Some(&Value::list(["D001943", "113705"])));
        assert_eq!(record.get("xref@db"), Some(&Value::list(["MeSH", "OMIM"])));
        assert_eq!(record.get("lab/name"), Some(&Value::from("Acme Labs")));
        assert!(record.get("flag").is_none());
    }

    #[test]
    fn test_entities_unescaped() {
        let root = parse_fragment(br#"<r a="x &amp; y">1 &lt; 2</r>"#).unwrap();
        assert_eq!(root.attr("a"), Some("x & y"));
        assert_eq!(root.text, "1 < 2");
    }

    #[test]
    fn test_malformed_fragment_is_an_error() {
        assert!(parse_fragment(b"<r><a></r>").is_err());
        assert!(parse_fragment(b"<r>").is_err());
        assert!(parse_fragment(b"").is_err());
    }
}
