
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const PAGE_HEADER_TYPE_CONTINUATION_OF_STREAM: u8 = 0x00;
pub const PAGE_HEADER_TYPE_BEGINNING_OF_STREAM: u8 = 0x02;
pub const PAGE_HEADER_TYPE_END_OF_STREAM: u8 = 0x04;
pub const DEFAULT_PRE_SKIP: u16 = 3840; // 3840 recommended in the RFC
pub const PAGE_HEADER_SIGNATURE: &[u8] = b"OggS";
pub const ID_PAGE_SIGNATURE: &[u8] = b"OpusHead";
pub const COMMENT_PAGE_SIGNATURE: &[u8] = b"OpusTags";
pub const PAGE_HEADER_SIZE: usize = 27;
pub const ID_PAGE_PAYLOAD_SIZE: usize = 19;

/// OggHeader is the metadata from the first page in the file (ID)
/// <https://tools.ietf.org/html/rfc7845.html#section-3>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OggHeader {
    pub channel_map: u8,
    pub channels: u8,
    pub output_gain: u16,
    pub pre_skip: u16,
    pub sample_rate: u32,
    pub version: u8,
}

/// OggPageHeader is the metadata for a Page
/// <https://tools.ietf.org/html/rfc7845.html#section-1>
#[derive(Debug, Clone)]
pub struct OggPageHeader {
    pub granule_position: u64,
    pub serial: u32,
    pub header_type: u8,
    pub index: u32,
}

impl OggPageHeader {
    /// Whether the page payload is an OpusHead or OpusTags header.
    pub fn is_opus_header(&self, payload: &[u8]) -> bool {
        payload.len() >= 8
            && (&payload[..8] == ID_PAGE_SIGNATURE || &payload[..8] == COMMENT_PAGE_SIGNATURE)
    }
}

/// Parse an OpusHead from a page payload
/// <https://tools.ietf.org/html/rfc7845.html#section-5.1>
pub fn parse_opus_head(payload: &[u8]) -> Result<OggHeader> {
    if payload.len() < ID_PAGE_PAYLOAD_SIZE {
        return Err(Error::ErrOggBadIdPageLength);
    }
    if &payload[..8] != ID_PAGE_SIGNATURE {
        return Err(Error::ErrOggBadIdPageSignature);
    }

    let mut reader = Cursor::new(&payload[8..]);
    Ok(OggHeader {
        version: reader.read_u8()?,
        channels: reader.read_u8()?,
        pre_skip: reader.read_u16::<LittleEndian>()?,
        sample_rate: reader.read_u32::<LittleEndian>()?,
        output_gain: reader.read_u16::<LittleEndian>()?,
        channel_map: reader.read_u8()?,
    })
}

/// OggReader returns page payloads of an Ogg/Opus stream held in memory.
pub struct OggReader {
    reader: Cursor<Bytes>,
    checksum_table: [u32; 256],
    do_checksum: bool,
}

impl OggReader {
    /// new returns a new Ogg reader positioned after the ID page, and the
    /// parsed Ogg header.
    pub fn new(data: Bytes, do_checksum: bool) -> Result<(OggReader, OggHeader)> {
        let mut r = OggReader {
            reader: Cursor::new(data),
            checksum_table: generate_checksum_table(),
            do_checksum,
        };

        let header = r.read_headers()?;

        Ok((r, header))
    }

    fn read_headers(&mut self) -> Result<OggHeader> {
        let (payload, page_header) = self
            .parse_next_page()?
            .ok_or(Error::ErrOggBadIdPageSignature)?;

        if page_header.header_type != PAGE_HEADER_TYPE_BEGINNING_OF_STREAM {
            return Err(Error::ErrOggBadIdPageType);
        }

        parse_opus_head(&payload)
    }

    /// Returns the next page payload and header, or None at end of stream.
    pub fn parse_next_page(&mut self) -> Result<Option<(Bytes, OggPageHeader)>> {
        let start = self.reader.position() as usize;
        let data = self.reader.get_ref().clone();
        if start >= data.len() {
            return Ok(None);
        }

        let mut h = [0u8; PAGE_HEADER_SIZE];
        self.reader.read_exact(&mut h)?;

        let mut head_reader = Cursor::new(h);
        let mut sig = [0u8; 4]; //0-3
        head_reader.read_exact(&mut sig)?;
        let _version = head_reader.read_u8()?; //4
        let header_type = head_reader.read_u8()?; //5
        let granule_position = head_reader.read_u64::<LittleEndian>()?; //6-13
        let serial = head_reader.read_u32::<LittleEndian>()?; //14-17
        let index = head_reader.read_u32::<LittleEndian>()?; //18-21
        let checksum = head_reader.read_u32::<LittleEndian>()?; //22-25
        let segments_count = head_reader.read_u8()?; //26

        if sig != PAGE_HEADER_SIGNATURE {
            return Err(Error::ErrOggBadIdPageSignature);
        }

        let mut size_buffer = vec![0u8; segments_count as usize];
        self.reader.read_exact(&mut size_buffer)?;
        let payload_size: usize = size_buffer.iter().map(|s| *s as usize).sum();

        let payload_start = self.reader.position() as usize;
        let payload_end = payload_start + payload_size;
        if payload_end > data.len() {
            return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        let payload = data.slice(payload_start..payload_end);
        self.reader.set_position(payload_end as u64);

        if self.do_checksum {
            let mut sum = 0;

            for (index, v) in h.iter().enumerate() {
                // Don't include expected checksum in our generation
                if index > 21 && index < 26 {
                    sum = update_checksum(&self.checksum_table, 0, sum);
                    continue;
                }
                sum = update_checksum(&self.checksum_table, *v, sum);
            }
            for v in size_buffer.iter().chain(payload.iter()) {
                sum = update_checksum(&self.checksum_table, *v, sum);
            }

            if sum != checksum {
                return Err(Error::ErrOggChecksumMismatch);
            }
        }

        Ok(Some((
            payload,
            OggPageHeader {
                granule_position,
                serial,
                header_type,
                index,
            },
        )))
    }

    /// Byte offset of the next page.
    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    pub fn seek(&mut self, position: u64) {
        self.reader.set_position(position);
    }
}

fn update_checksum(table: &[u32; 256], v: u8, sum: u32) -> u32 {
    (sum << 8) ^ table[(((sum >> 24) as u8) ^ v) as usize]
}

pub(crate) fn generate_checksum_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    const POLY: u32 = 0x04c11db7;

    for (i, t) in table.iter_mut().enumerate() {
        let mut r = (i as u32) << 24;
        for _ in 0..8 {
            if (r & 0x80000000) != 0 {
                r = (r << 1) ^ POLY;
            } else {
                r <<= 1;
            }
        }
        *t = r;
    }
    table
}

/// OggWriter builds single-segment-per-packet Ogg/Opus pages in memory.
pub struct OggWriter {
    out: BytesMut,
    serial: u32,
    page_index: u32,
    checksum_table: [u32; 256],
}

impl OggWriter {
    pub fn new(serial: u32, sample_rate: u32, channels: u8) -> Self {
        let mut w = OggWriter {
            out: BytesMut::new(),
            serial,
            page_index: 0,
            checksum_table: generate_checksum_table(),
        };

        let mut id = BytesMut::with_capacity(ID_PAGE_PAYLOAD_SIZE);
        id.put_slice(ID_PAGE_SIGNATURE);
        id.put_u8(1); // version
        id.put_u8(channels);
        id.put_u16_le(DEFAULT_PRE_SKIP);
        id.put_u32_le(sample_rate);
        id.put_u16_le(0); // output gain
        id.put_u8(0); // channel map
        w.write_page(&id, PAGE_HEADER_TYPE_BEGINNING_OF_STREAM, 0);

        let vendor = b"rtc-loadtest";
        let mut tags = BytesMut::new();
        tags.put_slice(COMMENT_PAGE_SIGNATURE);
        tags.put_u32_le(vendor.len() as u32);
        tags.put_slice(vendor);
        tags.put_u32_le(0);
        w.write_page(&tags, PAGE_HEADER_TYPE_CONTINUATION_OF_STREAM, 0);

        w
    }

    /// Writes one page holding `payload`, which must fit into 255 lacing
    /// segments.
    pub fn write_page(&mut self, payload: &[u8], header_type: u8, granule_position: u64) {
        let mut segments = vec![255u8; payload.len() / 255];
        segments.push((payload.len() % 255) as u8);

        let mut page = BytesMut::with_capacity(PAGE_HEADER_SIZE + segments.len() + payload.len());
        page.put_slice(PAGE_HEADER_SIGNATURE);
        page.put_u8(0);
        page.put_u8(header_type);
        page.put_u64_le(granule_position);
        page.put_u32_le(self.serial);
        page.put_u32_le(self.page_index);
        page.put_u32_le(0); // checksum placeholder
        page.put_u8(segments.len() as u8);
        page.put_slice(&segments);
        page.put_slice(payload);

        let checksum = page
            .iter()
            .fold(0, |sum, v| update_checksum(&self.checksum_table, *v, sum));
        page[22..26].copy_from_slice(&checksum.to_le_bytes());

        self.out.extend_from_slice(&page);
        self.page_index += 1;
    }

    pub fn finish(self) -> Bytes {
        self.out.freeze()
    }
}
