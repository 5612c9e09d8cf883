
use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};

pub const NAL_PREFIX_3BYTES: [u8; 3] = [0, 0, 1];
pub const NAL_PREFIX_4BYTES: [u8; 4] = [0, 0, 0, 1];

/// H264NalUnitType is the type of a NAL
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum H264NalUnitType {
    #[default]
    Unspecified = 0,
    /// Coded slice of a non-IDR picture
    CodedSliceNonIdr = 1,
    CodedSliceDataPartitionA = 2,
    CodedSliceDataPartitionB = 3,
    CodedSliceDataPartitionC = 4,
    /// Coded slice of an IDR picture
    CodedSliceIdr = 5,
    /// Supplemental enhancement information
    SEI = 6,
    /// Sequence parameter set
    SPS = 7,
    /// Picture parameter set
    PPS = 8,
    /// Access unit delimiter
    AUD = 9,
    EndOfSequence = 10,
    EndOfStream = 11,
    Filler = 12,
    Reserved,
}

impl From<u8> for H264NalUnitType {
    fn from(v: u8) -> Self {
        match v {
            0 => H264NalUnitType::Unspecified,
            1 => H264NalUnitType::CodedSliceNonIdr,
            2 => H264NalUnitType::CodedSliceDataPartitionA,
            3 => H264NalUnitType::CodedSliceDataPartitionB,
            4 => H264NalUnitType::CodedSliceDataPartitionC,
            5 => H264NalUnitType::CodedSliceIdr,
            6 => H264NalUnitType::SEI,
            7 => H264NalUnitType::SPS,
            8 => H264NalUnitType::PPS,
            9 => H264NalUnitType::AUD,
            10 => H264NalUnitType::EndOfSequence,
            11 => H264NalUnitType::EndOfStream,
            12 => H264NalUnitType::Filler,
            _ => H264NalUnitType::Reserved,
        }
    }
}

/// H265NalUnitType is the type of a NAL, restricted to the values the
/// looper needs to split access units.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum H265NalUnitType {
    /// 0..=31, coded slice segments
    Vcl(u8),
    /// Video parameter set
    VPS,
    /// Sequence parameter set
    SPS,
    /// Picture parameter set
    PPS,
    /// Access unit delimiter
    AUD,
    PrefixSEI,
    SuffixSEI,
    #[default]
    Other,
}

impl From<u8> for H265NalUnitType {
    fn from(v: u8) -> Self {
        match v {
            0..=31 => H265NalUnitType::Vcl(v),
            32 => H265NalUnitType::VPS,
            33 => H265NalUnitType::SPS,
            34 => H265NalUnitType::PPS,
            35 => H265NalUnitType::AUD,
            39 => H265NalUnitType::PrefixSEI,
            40 => H265NalUnitType::SuffixSEI,
            _ => H265NalUnitType::Other,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NalUnitType {
    H264(H264NalUnitType),
    H265(H265NalUnitType),
}

impl fmt::Display for NalUnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NalUnitType::H264(t) => write!(f, "H264 {t:?}"),
            NalUnitType::H265(t) => write!(f, "H265 {t:?}"),
        }
    }
}

/// Nal is one network abstraction layer unit, without its start code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nal {
    pub unit_type: NalUnitType,
    pub data: Bytes,
}

impl Nal {
    fn parse(data: Bytes, is_hevc: bool) -> Self {
        let unit_type = if is_hevc {
            NalUnitType::H265(H265NalUnitType::from((data[0] >> 1) & 0x3f))
        } else {
            NalUnitType::H264(H264NalUnitType::from(data[0] & 0x1f))
        };
        Nal { unit_type, data }
    }

    /// Whether the unit carries coded picture data.
    pub fn is_vcl(&self) -> bool {
        match self.unit_type {
            NalUnitType::H264(t) => matches!(
                t,
                H264NalUnitType::CodedSliceNonIdr
                    | H264NalUnitType::CodedSliceDataPartitionA
                    | H264NalUnitType::CodedSliceIdr
            ),
            NalUnitType::H265(t) => matches!(t, H265NalUnitType::Vcl(_)),
        }
    }

    /// Whether the unit opens a new access unit: the first slice of a
    /// picture, or a parameter set, delimiter or prefix SEI.
    pub fn starts_access_unit(&self) -> bool {
        match self.unit_type {
            NalUnitType::H264(t) => match t {
                // first_mb_in_slice == 0 is coded as a single set bit
                H264NalUnitType::CodedSliceNonIdr
                | H264NalUnitType::CodedSliceIdr
                | H264NalUnitType::CodedSliceDataPartitionA => {
                    self.data.get(1).is_some_and(|b| b & 0x80 != 0)
                }
                H264NalUnitType::SEI
                | H264NalUnitType::SPS
                | H264NalUnitType::PPS
                | H264NalUnitType::AUD => true,
                _ => false,
            },
            NalUnitType::H265(t) => match t {
                // first_slice_segment_in_pic_flag
                H265NalUnitType::Vcl(_) => self.data.get(2).is_some_and(|b| b & 0x80 != 0),
                H265NalUnitType::VPS
                | H265NalUnitType::SPS
                | H265NalUnitType::PPS
                | H265NalUnitType::AUD
                | H265NalUnitType::PrefixSEI => true,
                _ => false,
            },
        }
    }
}

/// H26xReader splits an Annex-B byte stream held in memory into NAL units.
pub struct H26xReader {
    data: Bytes,
    pos: usize,
    start: usize,
    is_hevc: bool,
}

impl H26xReader {
    /// Returns an error if `data` does not open with a start code.
    pub fn new(data: Bytes, is_hevc: bool) -> Result<Self> {
        let start = if data.starts_with(&NAL_PREFIX_4BYTES) {
            NAL_PREFIX_4BYTES.len()
        } else if data.starts_with(&NAL_PREFIX_3BYTES) {
            NAL_PREFIX_3BYTES.len()
        } else if is_hevc {
            return Err(Error::ErrDataIsNotH265Stream);
        } else {
            return Err(Error::ErrDataIsNotH264Stream);
        };

        Ok(H26xReader {
            data,
            pos: start,
            start,
            is_hevc,
        })
    }

    pub fn is_hevc(&self) -> bool {
        self.is_hevc
    }

    /// Returns the next NAL unit, or None at end of stream.
    pub fn next_nal(&mut self) -> Option<Nal> {
        let min_len = if self.is_hevc { 2 } else { 1 };
        while self.pos < self.data.len() {
            let rest = &self.data[self.pos..];
            let (end, next) = match rest.windows(3).position(|w| w == NAL_PREFIX_3BYTES) {
                Some(at) => (at, at + NAL_PREFIX_3BYTES.len()),
                None => (rest.len(), rest.len()),
            };

            // trailing zeros belong to the next start code
            let mut nal_end = end;
            while nal_end > 0 && rest[nal_end - 1] == 0 {
                nal_end -= 1;
            }

            let nal = self.data.slice(self.pos..self.pos + nal_end);
            self.pos += next;
            if nal.len() >= min_len {
                return Some(Nal::parse(nal, self.is_hevc));
            }
        }
        None
    }

    /// Moves back to the first NAL unit of the stream.
    pub fn rewind(&mut self) {
        self.pos = self.start;
    }

    pub(crate) fn not_a_stream(&self) -> Error {
        if self.is_hevc {
            Error::ErrDataIsNotH265Stream
        } else {
            Error::ErrDataIsNotH264Stream
        }
    }
}
