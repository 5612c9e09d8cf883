
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const IVF_FILE_HEADER_SIGNATURE: &[u8] = b"DKIF";
pub const IVF_FILE_HEADER_SIZE: usize = 32;
pub const IVF_FRAME_HEADER_SIZE: usize = 12;

/// IVFFileHeader 32-byte header for IVF files
/// <https://wiki.multimedia.cx/index.php/IVF>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IVFFileHeader {
    pub signature: [u8; 4],
    pub version: u16,
    pub header_size: u16,
    pub four_cc: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub timebase_denominator: u32,
    pub timebase_numerator: u32,
    pub num_frames: u32,
    pub unused: u32,
}

impl IVFFileHeader {
    pub fn vp8(width: u16, height: u16, fps: u32, num_frames: u32) -> Self {
        IVFFileHeader {
            signature: *b"DKIF",
            version: 0,
            header_size: IVF_FILE_HEADER_SIZE as u16,
            four_cc: *b"VP80",
            width,
            height,
            timebase_denominator: fps,
            timebase_numerator: 1,
            num_frames,
            unused: 0,
        }
    }

    pub fn marshal(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(IVF_FILE_HEADER_SIZE);
        out.put_slice(&self.signature);
        out.put_u16_le(self.version);
        out.put_u16_le(self.header_size);
        out.put_slice(&self.four_cc);
        out.put_u16_le(self.width);
        out.put_u16_le(self.height);
        out.put_u32_le(self.timebase_denominator);
        out.put_u32_le(self.timebase_numerator);
        out.put_u32_le(self.num_frames);
        out.put_u32_le(self.unused);
        out.freeze()
    }
}

/// IVFFrameHeader 12-byte header for IVF frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IVFFrameHeader {
    pub frame_size: u32,
    pub timestamp: u64,
}

/// IVFReader reads frames out of an IVF container held in memory.
pub struct IVFReader {
    data: Bytes,
    pos: usize,
    start: usize,
}

impl IVFReader {
    pub fn new(data: Bytes) -> Result<(IVFReader, IVFFileHeader)> {
        if data.len() < IVF_FILE_HEADER_SIZE {
            return Err(Error::ErrIvfSignatureMismatch);
        }

        let mut reader = Cursor::new(&data[..IVF_FILE_HEADER_SIZE]);
        let mut signature = [0u8; 4];
        reader.read_exact(&mut signature)?;
        let version = reader.read_u16::<LittleEndian>()?;
        let header_size = reader.read_u16::<LittleEndian>()?;
        let mut four_cc = [0u8; 4];
        reader.read_exact(&mut four_cc)?;

        let header = IVFFileHeader {
            signature,
            version,
            header_size,
            four_cc,
            width: reader.read_u16::<LittleEndian>()?,
            height: reader.read_u16::<LittleEndian>()?,
            timebase_denominator: reader.read_u32::<LittleEndian>()?,
            timebase_numerator: reader.read_u32::<LittleEndian>()?,
            num_frames: reader.read_u32::<LittleEndian>()?,
            unused: reader.read_u32::<LittleEndian>()?,
        };

        if header.signature != IVF_FILE_HEADER_SIGNATURE {
            return Err(Error::ErrIvfSignatureMismatch);
        }
        if header.version != 0 {
            return Err(Error::ErrIvfUnknownVersion);
        }

        let pos = (header.header_size as usize).max(IVF_FILE_HEADER_SIZE);
        Ok((
            IVFReader {
                data,
                pos,
                start: pos,
            },
            header,
        ))
    }

    /// Returns the next frame, or None at a clean end of file.
    pub fn parse_next_frame(&mut self) -> Result<Option<(Bytes, IVFFrameHeader)>> {
        let rest = self.data.len().saturating_sub(self.pos);
        if rest == 0 {
            return Ok(None);
        }
        if rest < IVF_FRAME_HEADER_SIZE {
            return Err(Error::ErrIvfIncompleteFrame);
        }

        let mut reader = Cursor::new(&self.data[self.pos..self.pos + IVF_FRAME_HEADER_SIZE]);
        let header = IVFFrameHeader {
            frame_size: reader.read_u32::<LittleEndian>()?,
            timestamp: reader.read_u64::<LittleEndian>()?,
        };

        let start = self.pos + IVF_FRAME_HEADER_SIZE;
        let end = start + header.frame_size as usize;
        if end > self.data.len() {
            return Err(Error::ErrIvfIncompleteFrame);
        }

        self.pos = end;
        Ok(Some((self.data.slice(start..end), header)))
    }

    pub fn rewind(&mut self) {
        self.pos = self.start;
    }
}

/// Appends one frame with its 12-byte header to `out`.
pub fn write_frame(out: &mut BytesMut, frame: &[u8], timestamp: u64) {
    out.put_u32_le(frame.len() as u32);
    out.put_u64_le(timestamp);
    out.put_slice(frame);
}
