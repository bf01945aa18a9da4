//! Catch-all decoder backed by symphonia's format probe and codec registry.

use crate::audio::decoder::{Decoder, DecoderFactory, MediaStream};
use crate::audio::format::{ChannelConfig, SampleType};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{Decoder as CodecDecoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::SampleFormat;
use tracing::{debug, trace, warn};

const LOG_TARGET: &str = "voicepool::audio::decoders::generic";

/// Lends a media stream to symphonia while letting the factory take it
/// back if the probe rejects it.
struct SharedStream {
    inner: Arc<Mutex<Option<Box<dyn MediaStream>>>>,
}

impl Read for SharedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(stream) => stream.read(buf),
            None => Ok(0),
        }
    }
}

impl Seek for SharedStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(stream) => stream.seek(pos),
            None => Err(io::Error::new(io::ErrorKind::Other, "stream was reclaimed")),
        }
    }
}

impl MediaSource for SharedStream {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Manages symphonia format reading and decoding into interleaved PCM.
pub struct SymphoniaDecoder {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn CodecDecoder>,
    track_id: u32,
    frequency: u32,
    channels: ChannelConfig,
    sample_type: SampleType,
    length: u64,
    pending: Vec<u8>,
    pending_pos: usize,
    finished: bool,
}

impl SymphoniaDecoder {
    fn open(mss: MediaSourceStream) -> Result<Self, SymphoniaError> {
        let probed = symphonia::default::get_probe().format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(SymphoniaError::Unsupported("no playable audio track"))?
            .clone();

        let decoder = symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

        let params = &track.codec_params;
        let frequency = params.sample_rate.ok_or(SymphoniaError::Unsupported("missing sample rate"))?;
        let channel_count = params
            .channels
            .ok_or(SymphoniaError::Unsupported("missing channel map"))?
            .count();
        let channels = ChannelConfig::from_count(channel_count)
            .ok_or(SymphoniaError::Unsupported("unhandled channel count"))?;
        let sample_type = match params.sample_format {
            Some(SampleFormat::F32) | Some(SampleFormat::F64) => SampleType::Float32,
            _ => SampleType::Int16,
        };

        debug!(
            target: LOG_TARGET,
            "Symphonia track {}: codec={:?} rate={} layout={} type={}",
            track.id, params.codec, frequency, channels, sample_type
        );

        Ok(SymphoniaDecoder {
            format_reader,
            decoder,
            track_id: track.id,
            frequency,
            channels,
            sample_type,
            length: params.n_frames.unwrap_or(0),
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
        })
    }

    /// Decodes the next packet of our track into `pending`. Returns false
    /// at end of stream or on an unrecoverable error.
    fn decode_next(&mut self) -> bool {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    trace!(target: LOG_TARGET, "End of stream reached.");
                    return false;
                }
                Err(SymphoniaError::ResetRequired) => {
                    warn!(target: LOG_TARGET, "Stream requires a decoder reset; treating as end of stream.");
                    return false;
                }
                Err(e) => {
                    warn!(target: LOG_TARGET, "Failed to read packet: {}", e);
                    return false;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    append_interleaved(&mut self.pending, self.sample_type, decoded);
                    return true;
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!(target: LOG_TARGET, "Skipping undecodable packet: {}", e);
                }
                Err(e) => {
                    warn!(target: LOG_TARGET, "Decoder failed: {}", e);
                    return false;
                }
            }
        }
    }
}

fn append_interleaved(pending: &mut Vec<u8>, sample_type: SampleType, decoded: AudioBufferRef<'_>) {
    let spec = *decoded.spec();
    let capacity = decoded.capacity() as u64;
    match sample_type {
        SampleType::Float32 => {
            let mut samples = SampleBuffer::<f32>::new(capacity, spec);
            samples.copy_interleaved_ref(decoded);
            pending.extend(samples.samples().iter().flat_map(|s| s.to_ne_bytes()));
        }
        _ => {
            let mut samples = SampleBuffer::<i16>::new(capacity, spec);
            samples.copy_interleaved_ref(decoded);
            pending.extend(samples.samples().iter().flat_map(|s| s.to_ne_bytes()));
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn frequency(&self) -> u32 {
        self.frequency
    }

    fn channel_config(&self) -> ChannelConfig {
        self.channels
    }

    fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn read(&mut self, dst: &mut [u8], frames: u32) -> u32 {
        let frame_size = (self.channels.channel_count() * self.sample_type.bytes_per_sample()) as usize;
        let want = (frames as usize * frame_size).min(dst.len() / frame_size * frame_size);
        let mut filled = 0;
        while filled < want {
            if self.pending_pos >= self.pending.len() {
                self.pending.clear();
                self.pending_pos = 0;
                if self.finished || !self.decode_next() {
                    self.finished = true;
                    break;
                }
                continue;
            }
            let n = (want - filled).min(self.pending.len() - self.pending_pos);
            dst[filled..filled + n].copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
            filled += n;
            self.pending_pos += n;
        }
        (filled / frame_size) as u32
    }
}

/// Accepts any container/codec pair symphonia can probe.
#[derive(Debug, Default)]
pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn create_decoder(&self, stream: &mut Option<Box<dyn MediaStream>>) -> Option<Box<dyn Decoder>> {
        let shared = Arc::new(Mutex::new(Some(stream.take()?)));
        let mss = MediaSourceStream::new(
            Box::new(SharedStream { inner: shared.clone() }),
            MediaSourceStreamOptions::default(),
        );
        match SymphoniaDecoder::open(mss) {
            Ok(decoder) => Some(Box::new(decoder)),
            Err(e) => {
                trace!(target: LOG_TARGET, "Symphonia rejected stream: {}", e);
                // Hand the stream back so the caller can rewind it.
                *stream = shared.lock().unwrap_or_else(|e| e.into_inner()).take();
                None
            }
        }
    }
}
