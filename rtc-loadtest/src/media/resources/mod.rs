#[cfg(test)]
mod resources_test;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};

use super::h26x_reader::NAL_PREFIX_4BYTES;
use super::ivf_reader::{IVFFileHeader, write_frame};
use super::ogg_reader::{OggWriter, PAGE_HEADER_TYPE_CONTINUATION_OF_STREAM};
use super::{AUDIO_RESOURCE, OPUS_CLOCK_RATE, OPUS_FRAME_DURATION, VideoCodec, VideoSpec, video_catalog};
use crate::error::{Error, Result};

/// ResourceProvider resolves resource names to their encoded contents.
pub trait ResourceProvider: Send + Sync {
    fn load(&self, name: &str) -> Result<Bytes>;
}

/// DirResources reads resources from a directory on disk.
#[derive(Debug, Clone)]
pub struct DirResources {
    root: PathBuf,
}

impl DirResources {
    pub fn new(root: impl AsRef<Path>) -> Self {
        DirResources {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl ResourceProvider for DirResources {
    fn load(&self, name: &str) -> Result<Bytes> {
        let path = self.root.join(name);
        match std::fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(Error::ErrNotFound(path.display().to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// MemoryResources serves resources from memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryResources {
    files: HashMap<String, Bytes>,
}

/// Frames per generated video loop.
const SYNTHETIC_LOOP_FRAMES: u32 = 30;
/// Opus pages per generated audio loop.
const SYNTHETIC_LOOP_PAGES: u64 = 50;
const SYNTHETIC_OPUS_PAYLOAD: usize = 60;

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data: Bytes) {
        self.files.insert(name.into(), data);
    }

    /// Generated bitstreams for the whole video catalog and the speech loop.
    /// Frame sizes follow each spec's target bitrate; the payloads are not
    /// decodable pictures.
    pub fn synthetic() -> Self {
        let mut resources = MemoryResources::new();
        for spec in video_catalog() {
            let data = match spec.codec {
                VideoCodec::H264 => synthetic_h264(&spec),
                VideoCodec::H265 => synthetic_h265(&spec),
                VideoCodec::VP8 => synthetic_vp8(&spec),
            };
            resources.insert(spec.resource_name(), data);
        }
        resources.insert(AUDIO_RESOURCE, synthetic_opus());
        resources
    }
}

impl ResourceProvider for MemoryResources {
    fn load(&self, name: &str) -> Result<Bytes> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ErrNotFound(name.to_owned()))
    }
}

fn frame_size(spec: &VideoSpec) -> usize {
    (spec.kbps as usize * 1000 / 8 / spec.fps.max(1) as usize).max(16)
}

// Filler never contains a zero byte, so no start code emulation can occur.
fn put_slice_body(out: &mut BytesMut, len: usize, seed: u32) {
    for i in 0..len {
        out.put_u8(((seed as usize + i) % 254 + 1) as u8);
    }
}

fn put_nal(out: &mut BytesMut, header: &[u8]) {
    out.put_slice(&NAL_PREFIX_4BYTES);
    out.put_slice(header);
}

fn synthetic_h264(spec: &VideoSpec) -> Bytes {
    let size = frame_size(spec);
    let mut out = BytesMut::new();
    for frame in 0..SYNTHETIC_LOOP_FRAMES {
        if frame == 0 {
            put_nal(&mut out, &[0x67, 0x42, 0xc0, 0x1f, 0xda, 0x01, 0x40]); // SPS
            put_nal(&mut out, &[0x68, 0xce, 0x3c, 0x80]); // PPS
            put_nal(&mut out, &[0x65, 0x88]); // IDR, first_mb_in_slice == 0
        } else {
            put_nal(&mut out, &[0x41, 0x9a]);
        }
        put_slice_body(&mut out, size, frame);
    }
    out.freeze()
}

fn synthetic_h265(spec: &VideoSpec) -> Bytes {
    let size = frame_size(spec);
    let mut out = BytesMut::new();
    for frame in 0..SYNTHETIC_LOOP_FRAMES {
        if frame == 0 {
            put_nal(&mut out, &[0x40, 0x01, 0x0c, 0x01]); // VPS
            put_nal(&mut out, &[0x42, 0x01, 0x01, 0x01]); // SPS
            put_nal(&mut out, &[0x44, 0x01, 0xc1, 0x72]); // PPS
            put_nal(&mut out, &[0x26, 0x01, 0xaf]); // IDR_W_RADL, first slice
        } else {
            put_nal(&mut out, &[0x02, 0x01, 0xd0]); // TRAIL_R, first slice
        }
        put_slice_body(&mut out, size, frame);
    }
    out.freeze()
}

fn synthetic_vp8(spec: &VideoSpec) -> Bytes {
    let size = frame_size(spec);
    let header = IVFFileHeader::vp8(
        spec.width as u16,
        spec.height as u16,
        spec.fps,
        SYNTHETIC_LOOP_FRAMES,
    );
    let mut out = BytesMut::new();
    out.put_slice(&header.marshal());

    for frame in 0..SYNTHETIC_LOOP_FRAMES {
        let mut data = BytesMut::with_capacity(size);
        if frame == 0 {
            // key frame tag, start code and dimensions
            data.put_slice(&[0x50, 0x42, 0x00, 0x9d, 0x01, 0x2a]);
            data.put_u16_le(spec.width as u16);
            data.put_u16_le(spec.height as u16);
        } else {
            data.put_slice(&[0x31, 0x0a, 0x00]);
        }
        let remaining = size.saturating_sub(data.len());
        put_slice_body(&mut data, remaining, frame);
        write_frame(&mut out, &data, frame as u64);
    }
    out.freeze()
}

fn synthetic_opus() -> Bytes {
    let samples_per_page = OPUS_CLOCK_RATE as u64 * OPUS_FRAME_DURATION.as_millis() as u64 / 1000;
    let mut writer = OggWriter::new(0x6c74_7374, OPUS_CLOCK_RATE, 1);
    for page in 0..SYNTHETIC_LOOP_PAGES {
        let mut payload = BytesMut::with_capacity(SYNTHETIC_OPUS_PAYLOAD);
        payload.put_u8(0x78); // TOC: SILK WB 20ms mono, one frame
        put_slice_body(&mut payload, SYNTHETIC_OPUS_PAYLOAD - 1, page as u32);
        writer.write_page(
            &payload,
            PAGE_HEADER_TYPE_CONTINUATION_OF_STREAM,
            (page + 1) * samples_per_page,
        );
    }
    writer.finish()
}
