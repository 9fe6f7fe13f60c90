use crate::attribute::{Attribute, Length};
use crate::decoder::DeflateDecoder;
use crate::format::SpecFormat;
use crate::spec::{ConditionalSpec, EncodedSpec, FormatSpec, StructSpec};

const FHCRC: u64 = 0x02;
const FEXTRA: u64 = 0x04;
const FNAME: u64 = 0x08;
const FCOMMENT: u64 = 0x10;

/// Longest file name or comment accepted, terminator included
const MAX_TEXT: u64 = 64 * 1024;

/// Single gzip member
pub fn gzip() -> SpecFormat {
    let flags = Attribute::u8("flags").bind();
    let file_name = Attribute::cstring("file name", MAX_TEXT).bind();

    let fixed: Vec<FormatSpec> = vec![
        Attribute::u8("id1").final_value(0x1Fu8).into(),
        Attribute::u8("id2").final_value(0x8Bu8).into(),
        Attribute::u8("compression method").one_of([8u8]).into(),
        (&flags).into(),
        Attribute::u32_le("modification time").into(),
        Attribute::u8("extra flags").into(),
        Attribute::u8("operating system").into(),
    ];

    let extra_len = Attribute::u16_le("extra length").bind();
    let extra = StructSpec::new("extra field")
        .declare(&extra_len)
        .child(&extra_len)
        .child(Attribute::opaque("extra data", Length::of(&extra_len)));

    let header = StructSpec::new("header")
        .result()
        .children(fixed.iter().cloned())
        .child(ConditionalSpec::when_flag("extra", &flags, FEXTRA, extra))
        .child(ConditionalSpec::when_flag("name", &flags, FNAME, &file_name))
        .child(ConditionalSpec::when_flag(
            "comment",
            &flags,
            FCOMMENT,
            Attribute::cstring("comment", MAX_TEXT),
        ))
        .child(ConditionalSpec::when_flag(
            "header crc",
            &flags,
            FHCRC,
            Attribute::u16_le("header crc16"),
        ));

    let trailer = StructSpec::new("trailer")
        .result()
        .child(Attribute::u32_le("crc32"))
        .child(Attribute::u32_le("input size"));

    let spec = StructSpec::new("gzip")
        .declare(&file_name)
        .child(header)
        .child(EncodedSpec::new("deflate stream", |_| Box::new(DeflateDecoder::new())).name_from(&file_name))
        .child(trailer);

    SpecFormat::new("gzip", StructSpec::new("gzip header").children(fixed), spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Value;
    use crate::format::Format;
    use crate::formats::tests::decode;
    use crate::input::read_fully;
    use crate::result::NodeKind;
    use crate::spec::Probe;
    use flate2::write::GzEncoder;
    use flate2::{Compression, GzBuilder};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const HEADER: [u8; 10] = [0x1F, 0x8B, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0x03];

    #[test]
    fn test_header_probe() {
        let format = gzip();
        assert_eq!(format.header().match_size(), 10);
        assert_eq!(format.header().probe_bytes(&HEADER), Probe::Matched);

        let mut deflate7 = HEADER;
        deflate7[2] = 7;
        assert_eq!(format.header().probe_bytes(&deflate7), Probe::Mismatch);

        let mut wrong_id = HEADER;
        wrong_id[1] = 0x8C;
        assert_eq!(format.header().probe_bytes(&wrong_id), Probe::Mismatch);
        assert_eq!(format.header().probe_bytes(&HEADER[..4]), Probe::Incomplete);
    }

    #[test]
    fn test_decode_named_member() {
        let mut encoder = GzBuilder::new()
            .filename("notes.txt")
            .comment("for testing")
            .write(Vec::new(), Compression::default());
        encoder.write_all(b"hello gzip").unwrap();
        let data = encoder.finish().unwrap();

        let decoded = decode(&gzip(), &data);
        assert_eq!(decoded.node.span(), Some(0..data.len() as u64));
        assert!(decoded.node.failure().is_none());

        let children = decoded.node.children();
        let names: Vec<&str> = children.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["header", "notes.txt", "trailer"]);

        let header = &children[0];
        let sections = header.sections();
        assert!(sections.iter().any(|s| s.renderable.name() == "comment"));
        assert!(sections.iter().all(|s| s.renderable.name() != "header crc16"));

        let stream = &decoded.discovered[0];
        assert_eq!(stream.kind(), NodeKind::EncodedInput);
        let content = stream.content().unwrap();
        let mut buf = vec![0u8; content.size() as usize];
        read_fully(content.as_ref(), &mut buf, 0).unwrap();
        assert_eq!(buf, b"hello gzip");

        let trailer = &children[2];
        let size = trailer
            .sections()
            .into_iter()
            .find(|s| s.renderable.name() == "input size")
            .unwrap();
        assert_eq!(size.range.end, data.len() as u64);
        assert!(matches!(
            size.renderable,
            crate::result::Renderable::Value { value: Value::Unsigned(10), .. }
        ));
    }

    #[test]
    fn test_unnamed_member_uses_stream_name() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&[0u8; 4096]).unwrap();
        let data = encoder.finish().unwrap();

        let decoded = decode(&gzip(), &data);
        assert_eq!(decoded.discovered[0].name(), "deflate stream");
        assert_eq!(decoded.discovered[0].content().unwrap().size(), 4096);
    }

    #[test]
    fn test_corrupt_body_fails_member() {
        let mut data = HEADER.to_vec();
        data.extend_from_slice(&[0xFF; 16]);

        let decoded = decode(&gzip(), &data);
        assert!(decoded.discovered[0].failure().is_some());
        assert!(decoded.node.failure().is_some());
    }
}
