use crate::attribute::{Attribute, Length};
use crate::format::SpecFormat;
use crate::spec::{StructSpec, VarArraySpec};

const SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// PNG image as a signature followed by chunks
pub fn png() -> SpecFormat {
    let signature = Attribute::bytes("signature", Length::Fixed(8)).final_value(SIGNATURE);

    let length = Attribute::u32_be("length").bind();
    let chunk = StructSpec::new("chunk")
        .result()
        .declare(&length)
        .child(&length)
        .child(Attribute::string("type", Length::Fixed(4)))
        .child(Attribute::opaque("data", Length::of(&length)))
        .child(Attribute::u32_be("crc"));

    let spec = StructSpec::new("png")
        .child(&signature)
        .child(VarArraySpec::to_end("chunks", chunk));

    SpecFormat::new("png", &signature, spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Value;
    use crate::format::Format;
    use crate::formats::tests::decode;
    use crate::result::Renderable;
    use crate::spec::{Probe, ProbeBuffer};
    use pretty_assertions::assert_eq;

    fn chunk(kind: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut out = (data.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(data);
        out.extend_from_slice(&[0, 0, 0, 0]);
        out
    }

    fn image() -> Vec<u8> {
        let mut data = SIGNATURE.to_vec();
        data.extend(chunk(b"IHDR", &[0, 0, 0, 1, 0, 0, 0, 1, 8, 2, 0, 0, 0]));
        data.extend(chunk(b"IEND", &[]));
        data
    }

    #[test]
    fn test_signature_consumes_eight_bytes() {
        let format = png();
        let mut buf = ProbeBuffer::new(&SIGNATURE);
        assert_eq!(format.header().matches(&mut buf), Probe::Matched);
        assert_eq!(buf.position(), 8);

        let mut other = SIGNATURE;
        other[0] = 0x88;
        let mut buf = ProbeBuffer::new(&other);
        assert_eq!(format.header().matches(&mut buf), Probe::Mismatch);
        assert_eq!(buf.position(), 0);
    }

    #[test]
    fn test_decode_chunks() {
        let data = image();
        let decoded = decode(&png(), &data);
        assert!(decoded.node.failure().is_none());
        assert!(decoded.discovered.is_empty());

        let chunks = decoded.node.children();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].span(), Some(8..33));
        assert_eq!(chunks[1].span(), Some(33..45));

        let kinds: Vec<Renderable> = chunks
            .iter()
            .map(|c| c.sections()[1].renderable.clone())
            .collect();
        assert_eq!(
            kinds,
            vec![
                Renderable::Value {
                    name: "type".into(),
                    value: Value::from("IHDR"),
                },
                Renderable::Value {
                    name: "type".into(),
                    value: Value::from("IEND"),
                },
            ]
        );
    }

    #[test]
    fn test_truncated_chunk_fails_alone() {
        let mut data = image();
        data.truncate(data.len() - 2);
        let decoded = decode(&png(), &data);

        let chunks = decoded.node.children();
        assert!(chunks[0].failure().is_none());
        assert!(chunks[1].failure().is_some());
        assert!(decoded.node.failure().is_none());
    }
}
