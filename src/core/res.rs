//! Android's compiled ("binary") XML chunk format.

use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ChunkType {
    StringPool = 0x0001,
    Xml = 0x0003,
    XmlStartNamespace = 0x0100,
    XmlEndNamespace = 0x0101,
    XmlStartElement = 0x0102,
    XmlEndElement = 0x0103,
    XmlCdata = 0x0104,
    XmlResourceMap = 0x0180,
}

impl ChunkType {
    pub fn from_u16(ty: u16) -> Option<Self> {
        Some(match ty {
            ty if ty == ChunkType::StringPool as u16 => ChunkType::StringPool,
            ty if ty == ChunkType::Xml as u16 => ChunkType::Xml,
            ty if ty == ChunkType::XmlStartNamespace as u16 => ChunkType::XmlStartNamespace,
            ty if ty == ChunkType::XmlEndNamespace as u16 => ChunkType::XmlEndNamespace,
            ty if ty == ChunkType::XmlStartElement as u16 => ChunkType::XmlStartElement,
            ty if ty == ChunkType::XmlEndElement as u16 => ChunkType::XmlEndElement,
            ty if ty == ChunkType::XmlCdata as u16 => ChunkType::XmlCdata,
            ty if ty == ChunkType::XmlResourceMap as u16 => ChunkType::XmlResourceMap,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResChunkHeader {
    /// Type identifier for this chunk. The meaning of this value depends
    /// on the containing chunk.
    pub ty: u16,
    /// Size of the chunk header (in bytes). Adding this value to the address
    /// of the chunk allows you to find its associated data (if any).
    pub header_size: u16,
    /// Total size of this chunk (in bytes), header included. Adding this value
    /// to the chunk allows you to completely skip its contents.
    pub size: u32,
}

impl ResChunkHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let ty = r.read_u16::<LittleEndian>()?;
        let header_size = r.read_u16::<LittleEndian>()?;
        let size = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            ty,
            header_size,
            size,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16::<LittleEndian>(self.ty)?;
        w.write_u16::<LittleEndian>(self.header_size)?;
        w.write_u32::<LittleEndian>(self.size)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResStringPoolHeader {
    pub string_count: u32,
    pub style_count: u32,
    pub flags: u32,
    pub strings_start: u32,
    pub styles_start: u32,
}

impl ResStringPoolHeader {
    pub const SORTED_FLAG: u32 = 1 << 0;
    pub const UTF8_FLAG: u32 = 1 << 8;

    pub fn read(r: &mut impl Read) -> Result<Self> {
        let string_count = r.read_u32::<LittleEndian>()?;
        let style_count = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u32::<LittleEndian>()?;
        let strings_start = r.read_u32::<LittleEndian>()?;
        let styles_start = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            string_count,
            style_count,
            flags,
            strings_start,
            styles_start,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.string_count)?;
        w.write_u32::<LittleEndian>(self.style_count)?;
        w.write_u32::<LittleEndian>(self.flags)?;
        w.write_u32::<LittleEndian>(self.strings_start)?;
        w.write_u32::<LittleEndian>(self.styles_start)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlNodeHeader {
    pub line_number: u32,
    pub comment: i32,
}

impl ResXmlNodeHeader {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let line_number = r.read_u32::<LittleEndian>()?;
        let comment = r.read_i32::<LittleEndian>()?;
        Ok(Self {
            line_number,
            comment,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32::<LittleEndian>(self.line_number)?;
        w.write_i32::<LittleEndian>(self.comment)?;
        Ok(())
    }
}

impl Default for ResXmlNodeHeader {
    fn default() -> Self {
        Self {
            line_number: 1,
            comment: -1,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlNamespace {
    pub prefix: i32,
    pub uri: i32,
}

impl ResXmlNamespace {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let prefix = r.read_i32::<LittleEndian>()?;
        let uri = r.read_i32::<LittleEndian>()?;
        Ok(Self { prefix, uri })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.prefix)?;
        w.write_i32::<LittleEndian>(self.uri)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlStartElement {
    /// String of the full namespace of this element.
    pub namespace: i32,
    /// String name of this node.
    pub name: i32,
    /// Byte offset from the start of this structure to where
    /// the attributes start.
    pub attribute_start: u16,
    /// Size of the attribute structures that follow.
    pub attribute_size: u16,
    /// Number of attributes associated with an ELEMENT.
    pub attribute_count: u16,
    /// Index (1-based) of the "id" attribute. 0 if none.
    pub id_index: u16,
    /// Index (1-based) of the "class" attribute. 0 if none.
    pub class_index: u16,
    /// Index (1-based) of the "style" attribute. 0 if none.
    pub style_index: u16,
}

impl Default for ResXmlStartElement {
    fn default() -> Self {
        Self {
            namespace: -1,
            name: -1,
            attribute_start: ATTRIBUTE_SIZE,
            attribute_size: ATTRIBUTE_SIZE,
            attribute_count: 0,
            id_index: 0,
            class_index: 0,
            style_index: 0,
        }
    }
}

const ATTRIBUTE_SIZE: u16 = 0x0014;

impl ResXmlStartElement {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        let attribute_start = r.read_u16::<LittleEndian>()?;
        let attribute_size = r.read_u16::<LittleEndian>()?;
        let attribute_count = r.read_u16::<LittleEndian>()?;
        let id_index = r.read_u16::<LittleEndian>()?;
        let class_index = r.read_u16::<LittleEndian>()?;
        let style_index = r.read_u16::<LittleEndian>()?;
        Ok(Self {
            namespace,
            name,
            attribute_start,
            attribute_size,
            attribute_count,
            id_index,
            class_index,
            style_index,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_u16::<LittleEndian>(self.attribute_start)?;
        w.write_u16::<LittleEndian>(self.attribute_size)?;
        w.write_u16::<LittleEndian>(self.attribute_count)?;
        w.write_u16::<LittleEndian>(self.id_index)?;
        w.write_u16::<LittleEndian>(self.class_index)?;
        w.write_u16::<LittleEndian>(self.style_index)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlAttribute {
    pub namespace: i32,
    pub name: i32,
    pub raw_value: i32,
    pub typed_value: ResValue,
}

impl ResXmlAttribute {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        let raw_value = r.read_i32::<LittleEndian>()?;
        let typed_value = ResValue::read(r)?;
        Ok(Self {
            namespace,
            name,
            raw_value,
            typed_value,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_i32::<LittleEndian>(self.raw_value)?;
        self.typed_value.write(w)?;
        Ok(())
    }

    /// The string this attribute holds, as an index into the pool.
    pub fn string_value(&self) -> Option<i32> {
        if self.raw_value >= 0 {
            Some(self.raw_value)
        } else if self.typed_value.data_type == ResValueType::String as u8 {
            Some(self.typed_value.data as i32)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlEndElement {
    pub namespace: i32,
    pub name: i32,
}

impl ResXmlEndElement {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let namespace = r.read_i32::<LittleEndian>()?;
        let name = r.read_i32::<LittleEndian>()?;
        Ok(Self { namespace, name })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.namespace)?;
        w.write_i32::<LittleEndian>(self.name)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResXmlCdata {
    /// The raw character data.
    pub data: i32,
    pub typed_data: ResValue,
}

impl ResXmlCdata {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let data = r.read_i32::<LittleEndian>()?;
        let typed_data = ResValue::read(r)?;
        Ok(Self { data, typed_data })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.data)?;
        self.typed_data.write(w)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResValue {
    pub size: u16,
    pub res0: u8,
    pub data_type: u8,
    pub data: u32,
}

impl ResValue {
    pub fn read(r: &mut impl Read) -> Result<Self> {
        let size = r.read_u16::<LittleEndian>()?;
        let res0 = r.read_u8()?;
        let data_type = r.read_u8()?;
        let data = r.read_u32::<LittleEndian>()?;
        Ok(Self {
            size,
            res0,
            data_type,
            data,
        })
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_u16::<LittleEndian>(self.size)?;
        w.write_u8(self.res0)?;
        w.write_u8(self.data_type)?;
        w.write_u32::<LittleEndian>(self.data)?;
        Ok(())
    }

    pub fn string(index: i32) -> Self {
        Self {
            size: 8,
            res0: 0,
            data_type: ResValueType::String as u8,
            data: index as u32,
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self {
            size: 8,
            res0: 0,
            data_type: ResValueType::IntBoolean as u8,
            data: if value { 0xffff_ffff } else { 0 },
        }
    }

    pub fn is_string(&self) -> bool {
        self.data_type == ResValueType::String as u8
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ResValueType {
    Null = 0x00,
    Reference = 0x01,
    Attribute = 0x02,
    String = 0x03,
    Float = 0x04,
    Dimension = 0x05,
    Fraction = 0x06,
    IntDec = 0x10,
    IntHex = 0x11,
    IntBoolean = 0x12,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResSpan {
    pub name: i32,
    pub first_char: u32,
    pub last_char: u32,
}

impl ResSpan {
    const END: i32 = -1;

    pub fn read(r: &mut impl Read) -> Result<Option<Self>> {
        let name = r.read_i32::<LittleEndian>()?;
        if name == Self::END {
            return Ok(None);
        }
        let first_char = r.read_u32::<LittleEndian>()?;
        let last_char = r.read_u32::<LittleEndian>()?;
        Ok(Some(Self {
            name,
            first_char,
            last_char,
        }))
    }

    pub fn write(&self, w: &mut impl Write) -> Result<()> {
        w.write_i32::<LittleEndian>(self.name)?;
        w.write_u32::<LittleEndian>(self.first_char)?;
        w.write_u32::<LittleEndian>(self.last_char)?;
        Ok(())
    }
}

/// The document's string table. Every name, namespace and string value in
/// the tree is an index into `strings`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StringPool {
    pub strings: Vec<String>,
    pub styles: Vec<Vec<ResSpan>>,
    pub flags: u32,
}

impl StringPool {
    pub fn new(utf8: bool) -> Self {
        Self {
            flags: if utf8 {
                ResStringPoolHeader::UTF8_FLAG
            } else {
                0
            },
            ..Default::default()
        }
    }

    pub fn is_utf8(&self) -> bool {
        self.flags & ResStringPoolHeader::UTF8_FLAG != 0
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn get(&self, index: i32) -> Option<&str> {
        let index = usize::try_from(index).ok()?;
        self.strings.get(index).map(String::as_str)
    }

    pub fn position(&self, s: &str) -> Option<i32> {
        self.strings.iter().position(|x| x == s).map(|i| i as i32)
    }

    pub fn push(&mut self, s: &str) -> i32 {
        self.flags &= !ResStringPoolHeader::SORTED_FLAG;
        self.strings.push(s.to_string());
        self.strings.len() as i32 - 1
    }

    /// Inserts `s` at `index`. Only span names are renumbered; references held
    /// by the XML tree are the caller's job.
    pub fn insert(&mut self, index: usize, s: &str) {
        self.flags &= !ResStringPoolHeader::SORTED_FLAG;
        self.strings.insert(index, s.to_string());
        if index < self.styles.len() {
            self.styles.insert(index, vec![]);
        }
        for span in self.styles.iter_mut().flatten() {
            if span.name >= index as i32 {
                span.name += 1;
            }
        }
    }

    fn read<R: Read + Seek>(r: &mut R, start_pos: u64, header: &ResChunkHeader) -> Result<Self> {
        let pool = ResStringPoolHeader::read(r)?;
        let end_pos = start_pos + header.size as u64;
        let tables = (pool.string_count as u64 + pool.style_count as u64) * 4;
        ensure!(
            header.header_size as u64 + tables <= header.size as u64,
            "string pool offset tables overrun the chunk"
        );
        r.seek(SeekFrom::Start(start_pos + header.header_size as u64))?;
        let mut string_offsets = Vec::with_capacity(pool.string_count as usize);
        for _ in 0..pool.string_count {
            string_offsets.push(r.read_u32::<LittleEndian>()?);
        }
        let mut style_offsets = Vec::with_capacity(pool.style_count as usize);
        for _ in 0..pool.style_count {
            style_offsets.push(r.read_u32::<LittleEndian>()?);
        }

        let is_utf8 = pool.flags & ResStringPoolHeader::UTF8_FLAG != 0;
        let strings_base = start_pos + pool.strings_start as u64;
        let mut strings = Vec::with_capacity(string_offsets.len());
        for (index, offset) in string_offsets.into_iter().enumerate() {
            let pos = strings_base + offset as u64;
            ensure!(pos < end_pos, "string {index} lies outside the pool");
            r.seek(SeekFrom::Start(pos))?;
            let s = if is_utf8 {
                read_utf8(r)
            } else {
                read_utf16(r, end_pos - pos)
            }
            .with_context(|| format!("While reading string {index}"))?;
            strings.push(s);
        }

        let styles_base = start_pos + pool.styles_start as u64;
        let mut styles = Vec::with_capacity(style_offsets.len());
        for offset in style_offsets {
            r.seek(SeekFrom::Start(styles_base + offset as u64))?;
            let mut spans = vec![];
            while let Some(span) = ResSpan::read(r)? {
                spans.push(span);
            }
            styles.push(spans);
        }
        Ok(Self {
            strings,
            styles,
            flags: pool.flags,
        })
    }

    fn write<W: Seek + Write>(&self, w: &mut W) -> Result<()> {
        let mut chunk = ChunkWriter::start_chunk(ChunkType::StringPool, w)?;
        ResStringPoolHeader::default().write(w)?;
        chunk.end_header(w)?;
        let indices_count = self.strings.len() + self.styles.len();
        let mut indices = Vec::with_capacity(indices_count);
        for _ in 0..indices_count {
            w.write_u32::<LittleEndian>(0)?;
        }
        let strings_start = w.stream_position()?;
        for string in &self.strings {
            indices.push(w.stream_position()? - strings_start);
            if self.is_utf8() {
                write_utf8_len(w, string.encode_utf16().count())?;
                write_utf8_len(w, string.len())?;
                w.write_all(string.as_bytes())?;
                w.write_u8(0)?;
            } else {
                let units: Vec<u16> = string.encode_utf16().collect();
                write_utf16_len(w, units.len())?;
                for unit in units {
                    w.write_u16::<LittleEndian>(unit)?;
                }
                w.write_u16::<LittleEndian>(0)?;
            }
        }
        while w.stream_position()? % 4 != 0 {
            w.write_u8(0)?;
        }
        let styles_start = w.stream_position()?;
        for style in &self.styles {
            indices.push(w.stream_position()? - styles_start);
            for span in style {
                span.write(w)?;
            }
            w.write_i32::<LittleEndian>(ResSpan::END)?;
        }
        if !self.styles.is_empty() {
            w.write_i32::<LittleEndian>(ResSpan::END)?;
            w.write_i32::<LittleEndian>(ResSpan::END)?;
        }
        let (start_chunk, end_chunk) = chunk.end_chunk(w)?;

        w.seek(SeekFrom::Start(start_chunk + 8))?;
        ResStringPoolHeader {
            string_count: self.strings.len() as u32,
            style_count: self.styles.len() as u32,
            flags: self.flags,
            strings_start: (strings_start - start_chunk) as u32,
            styles_start: if self.styles.is_empty() {
                0
            } else {
                (styles_start - start_chunk) as u32
            },
        }
        .write(w)?;
        for index in indices {
            w.write_u32::<LittleEndian>(index as u32)?;
        }
        w.seek(SeekFrom::Start(end_chunk))?;
        Ok(())
    }
}

fn read_utf8_len(r: &mut impl Read) -> Result<usize> {
    let high = r.read_u8()? as usize;
    if high & 0x80 != 0 {
        let low = r.read_u8()? as usize;
        Ok(((high & 0x7f) << 8) | low)
    } else {
        Ok(high)
    }
}

fn read_utf8(r: &mut impl Read) -> Result<String> {
    let _utf16_len = read_utf8_len(r)?;
    let len = read_utf8_len(r)?;
    let mut buf = vec![0; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn read_utf16(r: &mut impl Read, remaining: u64) -> Result<String> {
    let high = r.read_u16::<LittleEndian>()? as usize;
    let len = if high & 0x8000 != 0 {
        let low = r.read_u16::<LittleEndian>()? as usize;
        ((high & 0x7fff) << 16) | low
    } else {
        high
    };
    ensure!(len as u64 * 2 <= remaining, "string length {len} overruns the pool");
    let mut units = Vec::with_capacity(len);
    for _ in 0..len {
        units.push(r.read_u16::<LittleEndian>()?);
    }
    Ok(String::from_utf16(&units)?)
}

fn write_utf8_len(w: &mut impl Write, len: usize) -> Result<()> {
    ensure!(len <= 0x7fff, "string of {len} bytes is too long for a UTF-8 pool");
    if len > 0x7f {
        w.write_u8(((len >> 8) as u8) | 0x80)?;
    }
    w.write_u8(len as u8)?;
    Ok(())
}

fn write_utf16_len(w: &mut impl Write, len: usize) -> Result<()> {
    ensure!(len <= 0x7fff_ffff, "string of {len} units is too long");
    if len > 0x7fff {
        w.write_u16::<LittleEndian>(((len >> 16) as u16) | 0x8000)?;
    }
    w.write_u16::<LittleEndian>(len as u16)?;
    Ok(())
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Chunk {
    StringPool(StringPool),
    Xml(Vec<Chunk>),
    XmlStartNamespace(ResXmlNodeHeader, ResXmlNamespace),
    XmlEndNamespace(ResXmlNodeHeader, ResXmlNamespace),
    XmlStartElement(ResXmlNodeHeader, ResXmlStartElement, Vec<ResXmlAttribute>),
    XmlEndElement(ResXmlNodeHeader, ResXmlEndElement),
    XmlCdata(ResXmlNodeHeader, ResXmlCdata),
    XmlResourceMap(Vec<u32>),
    /// A chunk this module does not interpret, kept byte for byte.
    Unknown(ResChunkHeader, Vec<u8>),
}

impl Chunk {
    pub fn parse<R: Read + Seek>(r: &mut R) -> Result<Self> {
        let start_pos = r.stream_position()?;
        let stream_len = r.seek(SeekFrom::End(0))?;
        r.seek(SeekFrom::Start(start_pos))?;
        let header = ResChunkHeader::read(r)?;
        ensure!(
            header.header_size >= 8 && header.size >= header.header_size as u32,
            "invalid chunk header {:?} at {start_pos}",
            header
        );
        let body_pos = start_pos + header.header_size as u64;
        let end_pos = start_pos + header.size as u64;
        ensure!(end_pos <= stream_len, "chunk at {start_pos} overruns the document");
        let chunk = match ChunkType::from_u16(header.ty) {
            Some(ChunkType::StringPool) => {
                tracing::trace!("string pool");
                Chunk::StringPool(StringPool::read(r, start_pos, &header)?)
            }
            Some(ChunkType::Xml) => {
                tracing::trace!("xml");
                r.seek(SeekFrom::Start(body_pos))?;
                let mut chunks = vec![];
                while r.stream_position()? < end_pos {
                    chunks.push(Chunk::parse(r)?);
                }
                Chunk::Xml(chunks)
            }
            Some(ChunkType::XmlStartNamespace) => {
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(body_pos))?;
                Chunk::XmlStartNamespace(node_header, ResXmlNamespace::read(r)?)
            }
            Some(ChunkType::XmlEndNamespace) => {
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(body_pos))?;
                Chunk::XmlEndNamespace(node_header, ResXmlNamespace::read(r)?)
            }
            Some(ChunkType::XmlStartElement) => {
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(body_pos))?;
                let start_element = ResXmlStartElement::read(r)?;
                ensure!(
                    start_element.attribute_count == 0
                        || start_element.attribute_size >= ATTRIBUTE_SIZE,
                    "attribute size {} is too small",
                    start_element.attribute_size
                );
                let attributes_pos = body_pos + start_element.attribute_start as u64;
                let stride = start_element.attribute_size as u64;
                ensure!(
                    attributes_pos + stride * start_element.attribute_count as u64 <= end_pos,
                    "attributes overrun the element chunk"
                );
                let mut attributes = Vec::with_capacity(start_element.attribute_count as usize);
                for i in 0..start_element.attribute_count as u64 {
                    r.seek(SeekFrom::Start(attributes_pos + i * stride))?;
                    attributes.push(ResXmlAttribute::read(r)?);
                }
                Chunk::XmlStartElement(node_header, start_element, attributes)
            }
            Some(ChunkType::XmlEndElement) => {
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(body_pos))?;
                Chunk::XmlEndElement(node_header, ResXmlEndElement::read(r)?)
            }
            Some(ChunkType::XmlCdata) => {
                let node_header = ResXmlNodeHeader::read(r)?;
                r.seek(SeekFrom::Start(body_pos))?;
                Chunk::XmlCdata(node_header, ResXmlCdata::read(r)?)
            }
            Some(ChunkType::XmlResourceMap) => {
                tracing::trace!("xml resource map");
                r.seek(SeekFrom::Start(body_pos))?;
                let count = (header.size - header.header_size as u32) / 4;
                let mut resource_map = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    resource_map.push(r.read_u32::<LittleEndian>()?);
                }
                Chunk::XmlResourceMap(resource_map)
            }
            None => {
                tracing::trace!("unknown chunk {:#06x}", header.ty);
                let mut body = vec![0; header.size as usize - 8];
                r.read_exact(&mut body)?;
                Chunk::Unknown(header, body)
            }
        };
        r.seek(SeekFrom::Start(end_pos))?;
        Ok(chunk)
    }

    pub fn write<W: Seek + Write>(&self, w: &mut W) -> Result<()> {
        match self {
            Chunk::StringPool(pool) => pool.write(w)?,
            Chunk::Xml(chunks) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::Xml, w)?;
                chunk.end_header(w)?;
                for chunk in chunks {
                    chunk.write(w)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::XmlStartNamespace(node_header, namespace) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlStartNamespace, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                namespace.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlEndNamespace(node_header, namespace) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlEndNamespace, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                namespace.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlStartElement(node_header, start_element, attributes) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlStartElement, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                ResXmlStartElement {
                    attribute_start: ATTRIBUTE_SIZE,
                    attribute_size: ATTRIBUTE_SIZE,
                    attribute_count: attributes.len() as u16,
                    ..*start_element
                }
                .write(w)?;
                for attr in attributes {
                    attr.write(w)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::XmlEndElement(node_header, end_element) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlEndElement, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                end_element.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlCdata(node_header, cdata) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlCdata, w)?;
                node_header.write(w)?;
                chunk.end_header(w)?;
                cdata.write(w)?;
                chunk.end_chunk(w)?;
            }
            Chunk::XmlResourceMap(resource_map) => {
                let mut chunk = ChunkWriter::start_chunk(ChunkType::XmlResourceMap, w)?;
                chunk.end_header(w)?;
                for entry in resource_map {
                    w.write_u32::<LittleEndian>(*entry)?;
                }
                chunk.end_chunk(w)?;
            }
            Chunk::Unknown(header, body) => {
                header.write(w)?;
                w.write_all(body)?;
            }
        }
        Ok(())
    }
}

struct ChunkWriter {
    ty: ChunkType,
    start_chunk: u64,
    end_header: u64,
}

impl ChunkWriter {
    fn start_chunk<W: Seek + Write>(ty: ChunkType, w: &mut W) -> Result<Self> {
        let start_chunk = w.stream_position()?;
        ResChunkHeader::default().write(w)?;
        Ok(Self {
            ty,
            start_chunk,
            end_header: 0,
        })
    }

    fn end_header<W: Seek + Write>(&mut self, w: &mut W) -> Result<()> {
        self.end_header = w.stream_position()?;
        Ok(())
    }

    fn end_chunk<W: Seek + Write>(self, w: &mut W) -> Result<(u64, u64)> {
        debug_assert_ne!(self.end_header, 0);
        let end_chunk = w.stream_position()?;
        let header = ResChunkHeader {
            ty: self.ty as u16,
            header_size: (self.end_header - self.start_chunk) as u16,
            size: (end_chunk - self.start_chunk) as u32,
        };
        w.seek(SeekFrom::Start(self.start_chunk))?;
        header.write(w)?;
        w.seek(SeekFrom::Start(end_chunk))?;
        Ok((self.start_chunk, end_chunk))
    }
}

/// A parsed binary XML document: its string pool, the attribute resource map and
/// the flat list of tree nodes in document order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct XmlDocument {
    pub strings: StringPool,
    /// Resource ids of the first `resource_map.len()` strings.
    pub resource_map: Vec<u32>,
    pub nodes: Vec<Chunk>,
}

impl XmlDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let chunks = match Chunk::parse(&mut cursor)? {
            Chunk::Xml(chunks) => chunks,
            other => bail!("expected an XML document, found {:?}", chunk_name(&other)),
        };
        let mut strings = None;
        let mut resource_map = vec![];
        let mut nodes = vec![];
        for chunk in chunks {
            match chunk {
                Chunk::StringPool(pool) if strings.is_none() => strings = Some(pool),
                Chunk::XmlResourceMap(map) => resource_map = map,
                other => nodes.push(other),
            }
        }
        let mut doc = Self {
            strings: strings.context("XML document has no string pool")?,
            resource_map,
            nodes,
        };
        ensure!(
            doc.resource_map.len() <= doc.strings.len(),
            "resource map is longer than the string pool"
        );
        let len = doc.strings.len() as i32;
        let mut dangling = None;
        visit_string_refs(&mut doc.nodes, |index| {
            if *index >= len {
                dangling = Some(*index);
            }
        });
        if let Some(index) = dangling {
            bail!("string reference {index} is outside a pool of {len}");
        }
        Ok(doc)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = Cursor::new(Vec::new());
        let mut chunk = ChunkWriter::start_chunk(ChunkType::Xml, &mut w)?;
        chunk.end_header(&mut w)?;
        self.strings.write(&mut w)?;
        if !self.resource_map.is_empty() {
            Chunk::XmlResourceMap(self.resource_map.clone()).write(&mut w)?;
        }
        for node in &self.nodes {
            node.write(&mut w)?;
        }
        chunk.end_chunk(&mut w)?;
        Ok(w.into_inner())
    }

    pub fn string(&self, index: i32) -> Option<&str> {
        self.strings.get(index)
    }

    pub fn resource_id(&self, name: i32) -> Option<u32> {
        let index = usize::try_from(name).ok()?;
        self.resource_map.get(index).copied()
    }

    /// Index of `s` in the pool, appending it when absent.
    pub fn intern(&mut self, s: &str) -> i32 {
        match self.strings.position(s) {
            Some(index) => index,
            None => self.strings.push(s),
        }
    }

    /// Index of the attribute name `name` bound to `resource_id`.
    ///
    /// Attribute names carrying a resource id live at the front of the pool, parallel
    /// to the resource map, so a missing one is inserted at the end of that region and
    /// every reference behind it is renumbered.
    pub fn attribute_name(&mut self, name: &str, resource_id: u32) -> i32 {
        if let Some(index) = self
            .resource_map
            .iter()
            .zip(&self.strings.strings)
            .position(|(id, s)| *id == resource_id && s == name)
        {
            return index as i32;
        }
        let pos = self.resource_map.len();
        self.strings.insert(pos, name);
        self.resource_map.push(resource_id);
        let pos = pos as i32;
        visit_string_refs(&mut self.nodes, |index| {
            if *index >= pos {
                *index += 1;
            }
        });
        pos
    }

    /// Node indices of every start element named `name`.
    pub fn elements<'a>(&'a self, name: &'a str) -> impl Iterator<Item = usize> + 'a {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(move |(i, node)| match node {
                Chunk::XmlStartElement(_, el, _) if self.string(el.name) == Some(name) => Some(i),
                _ => None,
            })
    }

    pub fn attributes(&self, node: usize) -> &[ResXmlAttribute] {
        match self.nodes.get(node) {
            Some(Chunk::XmlStartElement(_, _, attrs)) => attrs,
            _ => &[],
        }
    }

    pub fn element_mut(
        &mut self,
        node: usize,
    ) -> Option<(&mut ResXmlStartElement, &mut Vec<ResXmlAttribute>)> {
        match self.nodes.get_mut(node) {
            Some(Chunk::XmlStartElement(_, el, attrs)) => Some((el, attrs)),
            _ => None,
        }
    }
}

fn chunk_name(chunk: &Chunk) -> &'static str {
    match chunk {
        Chunk::StringPool(_) => "string pool",
        Chunk::Xml(_) => "xml",
        Chunk::XmlStartNamespace(..) => "start namespace",
        Chunk::XmlEndNamespace(..) => "end namespace",
        Chunk::XmlStartElement(..) => "start element",
        Chunk::XmlEndElement(..) => "end element",
        Chunk::XmlCdata(..) => "cdata",
        Chunk::XmlResourceMap(_) => "resource map",
        Chunk::Unknown(..) => "unknown chunk",
    }
}

/// Calls `f` on every string pool reference held by the tree. Absent references are -1.
fn visit_string_refs(nodes: &mut [Chunk], mut f: impl FnMut(&mut i32)) {
    fn visit_value(value: &mut ResValue, f: &mut impl FnMut(&mut i32)) {
        if value.is_string() {
            let mut index = value.data as i32;
            f(&mut index);
            value.data = index as u32;
        }
    }
    for node in nodes {
        match node {
            Chunk::XmlStartNamespace(header, ns) | Chunk::XmlEndNamespace(header, ns) => {
                f(&mut header.comment);
                f(&mut ns.prefix);
                f(&mut ns.uri);
            }
            Chunk::XmlStartElement(header, el, attrs) => {
                f(&mut header.comment);
                f(&mut el.namespace);
                f(&mut el.name);
                for attr in attrs {
                    f(&mut attr.namespace);
                    f(&mut attr.name);
                    f(&mut attr.raw_value);
                    visit_value(&mut attr.typed_value, &mut f);
                }
            }
            Chunk::XmlEndElement(header, el) => {
                f(&mut header.comment);
                f(&mut el.namespace);
                f(&mut el.name);
            }
            Chunk::XmlCdata(header, cdata) => {
                f(&mut header.comment);
                f(&mut cdata.data);
                visit_value(&mut cdata.typed_data, &mut f);
            }
            _ => {}
        }
    }
}
