//! Extractor behaviour over whole documents.

use stitcher_ingestion::xml_stream::XML_DECL;
use stitcher_ingestion::{parse_fragment, StreamControl, XmlStream};

fn dump(n: usize) -> String {
    let mut doc = String::from("<?xml version=\"1.0\"?>\n<ClinVarSet>\n");
    for i in 0..n {
        doc.push_str(&format!(
            "  <VariationArchive id=\"{i}\" type=\"SNV\">\n    <Name>var {i} &amp; co</Name>\n    \
             <Gene symbol=\"BRCA{i}\"><Xref db=\"HGNC\">{i}</Xref></Gene>\n  </VariationArchive>\n"
        ));
        // a sibling whose name shares the prefix must not match
        doc.push_str("  <VariationArchiveSummary>x</VariationArchiveSummary>\n");
    }
    doc.push_str("</ClinVarSet>\n");
    doc
}

#[test]
fn test_consumer_fires_once_per_record() {
    for n in [0, 1, 7, 500] {
        let doc = dump(n);
        let mut fired = 0;
        let mut stream = XmlStream::new(doc.as_bytes(), "VariationArchive", |_: &mut StreamControl, _: &[u8]| {
            fired += 1
        });
        let count = stream.start().unwrap();
        drop(stream);
        assert_eq!(count, n);
        assert_eq!(fired, n);
    }
}

#[test]
fn test_delivered_fragments_reparse_to_original_elements() {
    let doc = dump(25);
    let original = parse_fragment(doc.as_bytes()).unwrap();
    let expected: Vec<_> = original.children_named("VariationArchive").cloned().collect();

    let mut fragments = Vec::new();
    let mut stream = XmlStream::new(doc.as_bytes(), "VariationArchive", |_: &mut StreamControl, bytes: &[u8]| {
        fragments.push(bytes.to_vec())
    });
    stream.start().unwrap();
    drop(stream);

    assert_eq!(fragments.len(), expected.len());
    for (bytes, element) in fragments.iter().zip(&expected) {
        assert!(bytes.starts_with(XML_DECL));
        assert_eq!(&parse_fragment(bytes).unwrap(), element);
    }
}

#[test]
fn test_early_stop_from_consumer() {
    let doc = dump(100);
    let mut stream = XmlStream::new(doc.as_bytes(), "VariationArchive", |ctl: &mut StreamControl, _: &[u8]| {
        if ctl.count() == 3 {
            ctl.set_done();
        }
    });
    let count = stream.start().unwrap();
    assert_eq!(count, 3);
    assert!(stream.is_done());
}

#[test]
fn test_self_nested_tag_ends_at_first_close() {
    let mut seen = Vec::new();
    let mut stream = XmlStream::new(&b"<r>AAA<r>X</r>more</r>"[..], "r", |_: &mut StreamControl, bytes: &[u8]| {
        seen.push(String::from_utf8_lossy(bytes).into_owned())
    });
    assert_eq!(stream.start().unwrap(), 1);
    drop(stream);
    assert_eq!(seen.len(), 1);
    assert!(seen[0].ends_with("<r>AAA<r>X</r>"));
}
