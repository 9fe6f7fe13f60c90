use crate::attribute::{Attribute, AttributeId, Length};
use crate::context::DecodeContext;
use crate::decoder::{Decoder, DeflateDecoder, StoreDecoder, UnsupportedDecoder};
use crate::format::SpecFormat;
use crate::spec::{ConditionalSpec, EncodedSpec, FormatSpec, StructSpec, VarArraySpec};

const LOCAL_FILE_HEADER: u32 = 0x0403_4B50;
const CENTRAL_DIRECTORY: u32 = 0x0201_4B50;
const END_OF_CENTRAL_DIRECTORY: u32 = 0x0605_4B50;
const DATA_DESCRIPTOR: u32 = 0x0807_4B50;

const STORED: u64 = 0;
const DEFLATED: u64 = 8;

/// General purpose flag: sizes follow the data in a descriptor
const FLAG_DATA_DESCRIPTOR: u64 = 0x08;

fn signature(name: &str, value: u32) -> FormatSpec {
    Attribute::u32_le(name).final_value(value).into()
}

/// ZIP archive read front to back through its local entries
pub fn zip() -> SpecFormat {
    let flags = Attribute::u16_le("flags").bind();
    let method = Attribute::u16_le("compression method").bind();
    let compressed_size = Attribute::u32_le("compressed size").bind();
    let name_len = Attribute::u16_le("file name length").bind();
    let extra_len = Attribute::u16_le("extra field length").bind();
    let file_name = Attribute::string("file name", Length::of(&name_len)).bind();

    let fixed: Vec<FormatSpec> = vec![
        signature("signature", LOCAL_FILE_HEADER),
        Attribute::u16_le("version needed").into(),
        (&flags).into(),
        (&method).into(),
        Attribute::u16_le("modification time").into(),
        Attribute::u16_le("modification date").into(),
        Attribute::u32_le("crc32").into(),
        (&compressed_size).into(),
        Attribute::u32_le("uncompressed size").into(),
        (&name_len).into(),
        (&extra_len).into(),
    ];

    // The header binds the sizes its sibling data spec needs, so they are
    // declared on the entry rather than on the header itself.
    let local_header = StructSpec::new("local file header")
        .declare(&name_len)
        .declare(&extra_len)
        .children(fixed.iter().cloned())
        .child(&file_name)
        .child(Attribute::opaque("extra field", Length::of(&extra_len)));

    let entry = StructSpec::new("entry")
        .result()
        .declare(&flags)
        .declare(&method)
        .declare(&compressed_size)
        .declare(&file_name)
        .child(local_header)
        .child(file_data(&flags, &method, &compressed_size, &file_name));

    let spec = StructSpec::new("zip")
        .child(VarArraySpec::until(
            "entries",
            entry,
            signature("central directory signature", CENTRAL_DIRECTORY),
        ))
        .child(
            VarArraySpec::until(
                "central directory",
                central_directory_entry(),
                signature("end of central directory signature", END_OF_CENTRAL_DIRECTORY),
            )
            .min(0),
        )
        .child(end_of_central_directory());

    SpecFormat::new("zip", StructSpec::new("zip header").children(fixed), spec)
}

/// Entry payload, bounded by the header's size unless it streams into a descriptor
fn file_data(flags: &Attribute, method: &Attribute, size: &Attribute, file_name: &Attribute) -> ConditionalSpec {
    let method = method.id();
    let sized: FormatSpec = EncodedSpec::new("file data", move |cx| entry_decoder(cx, method))
        .length(Length::of(size))
        .name_from(file_name)
        .into();
    let streamed: FormatSpec = StructSpec::new("streamed data")
        .child(EncodedSpec::new("file data", move |cx| entry_decoder(cx, method)).name_from(file_name))
        .child(data_descriptor())
        .into();

    let (flags, size) = (flags.id(), size.id());
    ConditionalSpec::new("file data", move |cx| {
        let value = |id: AttributeId| cx.get_attribute(id).and_then(|v| v.as_u64()).unwrap_or(0);
        // Only deflate marks its own end; stored data with unknown size cannot be bounded
        let streams = value(flags) & FLAG_DATA_DESCRIPTOR != 0 && value(method) == DEFLATED && value(size) == 0;
        Some(if streams { streamed.clone() } else { sized.clone() })
    })
}

fn entry_decoder(cx: &DecodeContext<'_>, method: AttributeId) -> Box<dyn Decoder> {
    match cx.get_attribute(method).and_then(|v| v.as_u64()) {
        Some(STORED) => Box::new(StoreDecoder::new()),
        Some(DEFLATED) => Box::new(DeflateDecoder::new()),
        Some(other) => Box::new(UnsupportedDecoder::new(format!("zip compression method {}", other))),
        None => Box::new(UnsupportedDecoder::new("zip entry without compression method")),
    }
}

fn data_descriptor() -> StructSpec {
    // The descriptor signature is optional
    let leading = ConditionalSpec::new("descriptor signature", |cx| {
        let next = cx.peek(4).ok()?;
        (next == DATA_DESCRIPTOR.to_le_bytes()).then(|| signature("descriptor signature", DATA_DESCRIPTOR))
    });
    StructSpec::new("data descriptor")
        .result()
        .child(leading)
        .child(Attribute::u32_le("crc32"))
        .child(Attribute::u32_le("compressed size"))
        .child(Attribute::u32_le("uncompressed size"))
}

fn central_directory_entry() -> StructSpec {
    let name_len = Attribute::u16_le("file name length").bind();
    let extra_len = Attribute::u16_le("extra field length").bind();
    let comment_len = Attribute::u16_le("file comment length").bind();

    StructSpec::new("central directory entry")
        .result()
        .declare(&name_len)
        .declare(&extra_len)
        .declare(&comment_len)
        .child(signature("signature", CENTRAL_DIRECTORY))
        .child(Attribute::u16_le("version made by"))
        .child(Attribute::u16_le("version needed"))
        .child(Attribute::u16_le("flags"))
        .child(Attribute::u16_le("compression method"))
        .child(Attribute::u16_le("modification time"))
        .child(Attribute::u16_le("modification date"))
        .child(Attribute::u32_le("crc32"))
        .child(Attribute::u32_le("compressed size"))
        .child(Attribute::u32_le("uncompressed size"))
        .child(&name_len)
        .child(&extra_len)
        .child(&comment_len)
        .child(Attribute::u16_le("disk number start"))
        .child(Attribute::u16_le("internal attributes"))
        .child(Attribute::u32_le("external attributes"))
        .child(Attribute::u32_le("local header offset"))
        .child(Attribute::string("file name", Length::of(&name_len)))
        .child(Attribute::opaque("extra field", Length::of(&extra_len)))
        .child(Attribute::string("file comment", Length::of(&comment_len)))
}

fn end_of_central_directory() -> StructSpec {
    let comment_len = Attribute::u16_le("comment length").bind();

    StructSpec::new("end of central directory")
        .result()
        .declare(&comment_len)
        .child(signature("signature", END_OF_CENTRAL_DIRECTORY))
        .child(Attribute::u16_le("disk number"))
        .child(Attribute::u16_le("central directory disk"))
        .child(Attribute::u16_le("entries on disk"))
        .child(Attribute::u16_le("total entries"))
        .child(Attribute::u32_le("central directory size"))
        .child(Attribute::u32_le("central directory offset"))
        .child(&comment_len)
        .child(Attribute::string("comment", Length::of(&comment_len)))
}
