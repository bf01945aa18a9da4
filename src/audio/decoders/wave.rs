//! RIFF/WAVE reader with `smpl` loop point support.

use crate::audio::decoder::{Decoder, DecoderFactory, MediaStream};
use crate::audio::format::{ChannelConfig, SampleType};
use std::io::{self, Read, Seek, SeekFrom};
use tracing::{debug, trace, warn};

const LOG_TARGET: &str = "voicepool::audio::decoders::wave";

const FORMAT_PCM: u16 = 0x0001;
const FORMAT_FLOAT: u16 = 0x0003;
const FORMAT_MULAW: u16 = 0x0007;
const FORMAT_EXTENSIBLE: u16 = 0xFFFE;

struct WaveHeader {
    channels: ChannelConfig,
    sample_type: SampleType,
    frequency: u32,
    block_align: u32,
    data_len: u64,
    loop_points: (u64, u64),
}

fn read_u16(stream: &mut dyn MediaStream) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(stream: &mut dyn MediaStream) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_tag(stream: &mut dyn MediaStream) -> io::Result<[u8; 4]> {
    let mut tag = [0u8; 4];
    stream.read_exact(&mut tag)?;
    Ok(tag)
}

fn skip(stream: &mut dyn MediaStream, len: u64) -> io::Result<()> {
    // Chunks are word aligned.
    stream.seek(SeekFrom::Current((len + (len & 1)) as i64))?;
    Ok(())
}

/// Parses the RIFF header up to the start of the `data` chunk. Returns
/// `Ok(None)` when the stream is not a WAVE file this decoder handles.
fn parse_header(stream: &mut dyn MediaStream) -> io::Result<Option<WaveHeader>> {
    if &read_tag(stream)? != b"RIFF" {
        return Ok(None);
    }
    read_u32(stream)?;
    if &read_tag(stream)? != b"WAVE" {
        return Ok(None);
    }

    let mut layout: Option<(ChannelConfig, SampleType, u32, u32)> = None;
    let mut loop_points = (0u64, 0u64);
    loop {
        let tag = read_tag(stream)?;
        let len = u64::from(read_u32(stream)?);
        match &tag {
            b"fmt " => {
                if len < 16 {
                    return Ok(None);
                }
                let mut tag = read_u16(stream)?;
                let channels = read_u16(stream)?;
                let frequency = read_u32(stream)?;
                read_u32(stream)?;
                let block_align = u32::from(read_u16(stream)?);
                let bits = read_u16(stream)?;
                let mut consumed = 16;
                if tag == FORMAT_EXTENSIBLE && len >= 40 {
                    // cbSize, valid bits, channel mask, then the subformat GUID
                    // whose first two bytes are the real format tag.
                    read_u16(stream)?;
                    read_u16(stream)?;
                    read_u32(stream)?;
                    tag = read_u16(stream)?;
                    consumed += 10;
                }
                skip(stream, len - consumed)?;

                let sample_type = match (tag, bits) {
                    (FORMAT_PCM, 8) => SampleType::UInt8,
                    (FORMAT_PCM, 16) => SampleType::Int16,
                    (FORMAT_FLOAT, 32) => SampleType::Float32,
                    (FORMAT_MULAW, 8) => SampleType::Mulaw,
                    _ => {
                        debug!(target: LOG_TARGET, "Unhandled wave format tag {:#06x} / {} bits", tag, bits);
                        return Ok(None);
                    }
                };
                let Some(channels) = ChannelConfig::from_count(usize::from(channels)) else {
                    debug!(target: LOG_TARGET, "Unhandled wave channel count {}", channels);
                    return Ok(None);
                };
                if block_align != channels.channel_count() * sample_type.bytes_per_sample() {
                    warn!(target: LOG_TARGET, "Wave block alignment {} does not match layout", block_align);
                    return Ok(None);
                }
                layout = Some((channels, sample_type, frequency, block_align));
            }
            b"smpl" if len >= 36 => {
                let mut header = [0u8; 36];
                stream.read_exact(&mut header)?;
                let loops = u32::from_le_bytes([header[28], header[29], header[30], header[31]]);
                let mut consumed = 36;
                if loops > 0 && len >= 36 + 24 {
                    let mut first = [0u8; 24];
                    stream.read_exact(&mut first)?;
                    consumed += 24;
                    let start = u32::from_le_bytes([first[8], first[9], first[10], first[11]]);
                    let end = u32::from_le_bytes([first[12], first[13], first[14], first[15]]);
                    // smpl end points are inclusive.
                    loop_points = (u64::from(start), u64::from(end) + 1);
                    trace!(target: LOG_TARGET, "smpl loop points {:?}", loop_points);
                }
                skip(stream, len - consumed)?;
            }
            b"data" => {
                let Some((channels, sample_type, frequency, block_align)) = layout else {
                    return Ok(None);
                };
                return Ok(Some(WaveHeader {
                    channels,
                    sample_type,
                    frequency,
                    block_align,
                    data_len: len,
                    loop_points,
                }));
            }
            _ => skip(stream, len)?,
        }
    }
}

/// Caps a claimed `data` length at the bytes actually left in the stream.
/// Streamed files often leave the size field at its maximum.
fn bytes_left(stream: &mut dyn MediaStream, claimed: u64) -> io::Result<u64> {
    let start = stream.stream_position()?;
    let end = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(start))?;
    Ok(claimed.min(end.saturating_sub(start)))
}

pub struct WaveDecoder {
    stream: Box<dyn MediaStream>,
    header: WaveHeader,
    remaining: u64,
}

impl Decoder for WaveDecoder {
    fn frequency(&self) -> u32 {
        self.header.frequency
    }

    fn channel_config(&self) -> ChannelConfig {
        self.header.channels
    }

    fn sample_type(&self) -> SampleType {
        self.header.sample_type
    }

    fn length(&self) -> u64 {
        self.header.data_len / u64::from(self.header.block_align)
    }

    fn read(&mut self, dst: &mut [u8], frames: u32) -> u32 {
        let block = u64::from(self.header.block_align);
        let want = (u64::from(frames) * block).min(self.remaining).min(dst.len() as u64) as usize;
        let want = want - want % block as usize;
        let mut filled = 0;
        while filled < want {
            match self.stream.read(&mut dst[filled..want]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(target: LOG_TARGET, "Wave read failed: {}", e);
                    break;
                }
            }
        }
        self.remaining -= filled as u64;
        (filled as u64 / block) as u32
    }

    fn loop_points(&self) -> (u64, u64) {
        self.header.loop_points
    }
}

#[derive(Debug, Default)]
pub struct WaveDecoderFactory;

impl DecoderFactory for WaveDecoderFactory {
    fn create_decoder(&self, stream: &mut Option<Box<dyn MediaStream>>) -> Option<Box<dyn Decoder>> {
        let source = stream.as_mut()?.as_mut();
        let mut header = match parse_header(source) {
            Ok(Some(header)) => header,
            Ok(None) => return None,
            Err(e) => {
                trace!(target: LOG_TARGET, "Not a wave stream: {}", e);
                return None;
            }
        };
        let available = match bytes_left(stream.as_mut()?.as_mut(), header.data_len) {
            Ok(available) => available,
            Err(e) => {
                trace!(target: LOG_TARGET, "Could not size wave data: {}", e);
                return None;
            }
        };
        if available < header.data_len {
            debug!(
                target: LOG_TARGET,
                "Wave data chunk claims {} bytes, {} present", header.data_len, available
            );
        }
        header.data_len = available - available % u64::from(header.block_align);
        let stream = stream.take()?;
        Some(Box::new(WaveDecoder {
            stream,
            remaining: header.data_len,
            header,
        }))
    }
}
