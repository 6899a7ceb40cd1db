//! Symphonia-backed media backend.
//!
//! Uses Symphonia to:
//! - open a local file or an HTTP(S) URL with the interrupt hook installed
//! - probe the container and pick the default audio track
//! - read compressed packets and decode them into interleaved `f32`

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::{AudioBufferRef, SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::http_source::HttpStreamSource;
use crate::media::{
    AudioDecoder, ChannelLayout, DecodeOutcome, DecodedFrame, InputFormat, MediaBackend,
    MediaInput, Packet, SampleFormat,
};
use crate::watchdog::InterruptHook;

/// Media backend for local files and HTTP(S) streams.
#[derive(Clone, Debug)]
pub struct SymphoniaBackend {
    poll_interval: Duration,
}

impl SymphoniaBackend {
    /// `poll_interval` bounds how long a network read waits between interrupt checks.
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Default for SymphoniaBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl MediaBackend for SymphoniaBackend {
    fn open_input(&self, source: &str, hook: InterruptHook) -> Result<Box<dyn MediaInput>> {
        let mut hint = Hint::new();
        let media: Box<dyn MediaSource> = if is_http_url(source) {
            if let Some(ext) = infer_ext_from_url(source) {
                hint.with_extension(&ext);
            }
            Box::new(
                HttpStreamSource::connect(source, hook, self.poll_interval)
                    .with_context(|| format!("connect {source}"))?,
            )
        } else {
            let path = Path::new(source);
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                hint.with_extension(ext);
            }
            let file = File::open(path).with_context(|| format!("open {:?}", path))?;
            Box::new(InterruptibleFile::new(file, hook))
        };

        Ok(Box::new(SymphoniaInput {
            hint,
            stream: Some(MediaSourceStream::new(media, Default::default())),
            reader: None,
        }))
    }
}

fn is_http_url(source: &str) -> bool {
    let lower = source.get(..8).unwrap_or(source).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Extension of the last path segment of `url`, ignoring the query string.
fn infer_ext_from_url(url: &str) -> Option<String> {
    let tail = url.split('?').next().unwrap_or(url);
    let file = tail.rsplit('/').next().unwrap_or(tail);
    let mut parts = file.rsplit('.');
    let ext = parts.next()?;
    if parts.next().is_some() {
        Some(ext.to_ascii_lowercase())
    } else {
        None
    }
}

/// Local file that honours the interrupt hook on every read.
struct InterruptibleFile {
    file: File,
    len: Option<u64>,
    hook: InterruptHook,
}

impl InterruptibleFile {
    fn new(file: File, hook: InterruptHook) -> Self {
        let len = file.metadata().ok().map(|m| m.len());
        Self { file, len, hook }
    }
}

impl Read for InterruptibleFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.hook.check()?;
        self.file.read(buf)
    }
}

impl Seek for InterruptibleFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl MediaSource for InterruptibleFile {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        self.len
    }
}

struct SymphoniaInput {
    hint: Hint,
    stream: Option<MediaSourceStream>,
    reader: Option<Box<dyn FormatReader>>,
}

impl SymphoniaInput {
    fn reader(&mut self) -> Result<&mut Box<dyn FormatReader>> {
        self.reader
            .as_mut()
            .ok_or_else(|| anyhow!("stream info has not been probed"))
    }
}

impl MediaInput for SymphoniaInput {
    fn find_stream_info(&mut self) -> Result<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| anyhow!("stream info already probed"))?;
        let probed = symphonia::default::get_probe()
            .format(
                &self.hint,
                stream,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .context("probe container")?;
        self.reader = Some(probed.format);
        Ok(())
    }

    fn open_best_audio_decoder(&mut self) -> Result<(u32, Box<dyn AudioDecoder>)> {
        let reader = self.reader()?;
        let track = reader
            .default_track()
            .filter(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .or_else(|| {
                reader
                    .tracks()
                    .iter()
                    .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            })
            .ok_or_else(|| anyhow!("No audio track"))?;

        let params = track.codec_params.clone();
        let format = input_format_from_params(&params)?;
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .context("create decoder")?;

        tracing::info!(
            track = track.id,
            codec = codec_name_from_params(&params).unwrap_or("unknown"),
            duration_ms = ?duration_ms_from_codec_params(&params),
            input = %format,
            "audio decoder opened"
        );

        Ok((
            track.id,
            Box::new(SymphoniaDecoder {
                decoder,
                track_id: track.id,
                format,
                sample_buf: None,
            }),
        ))
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        match self.reader()?.next_packet() {
            Ok(p) => Ok(Some(Packet {
                stream: p.track_id(),
                ts: p.ts(),
                data: p.data,
            })),
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(SymphoniaError::ResetRequired) => Ok(None),
            Err(e) => Err(anyhow!(e)).context("read packet"),
        }
    }
}

struct SymphoniaDecoder {
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    format: InputFormat,
    sample_buf: Option<(SignalSpec, SampleBuffer<f32>)>,
}

impl AudioDecoder for SymphoniaDecoder {
    fn input_format(&self) -> InputFormat {
        self.format
    }

    fn decode(&mut self, ts: u64, data: &[u8], frame: &mut DecodedFrame) -> Result<DecodeOutcome> {
        let packet = symphonia::core::formats::Packet::new_from_slice(self.track_id, ts, 0, data);
        let decoded = match self.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!(ts, "skipping undecodable packet: {e}");
                return Ok(DecodeOutcome {
                    consumed: data.len(),
                    got_frame: false,
                });
            }
            Err(e) => return Err(anyhow!(e)).context("decode packet"),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        let format = InputFormat {
            channel_layout: ChannelLayout::from_bits(spec.channels.bits()),
            sample_format: sample_format_of(&decoded),
            sample_rate: spec.rate,
        };

        let needed = decoded.capacity() * spec.channels.count();
        let reusable = self
            .sample_buf
            .as_ref()
            .is_some_and(|(buf_spec, buf)| *buf_spec == spec && buf.capacity() >= needed);
        if !reusable {
            self.sample_buf = None;
        }
        let capacity = decoded.capacity() as u64;
        let (_, buf) = self
            .sample_buf
            .get_or_insert_with(|| (spec, SampleBuffer::<f32>::new(capacity, spec)));
        buf.copy_interleaved_ref(decoded);

        frame.samples.clear();
        frame.samples.extend_from_slice(buf.samples());
        frame.frames = frames;
        frame.format = Some(format);

        Ok(DecodeOutcome {
            consumed: data.len(),
            got_frame: frames > 0,
        })
    }
}

fn sample_format_of(buf: &AudioBufferRef<'_>) -> SampleFormat {
    match buf {
        AudioBufferRef::U8(_) => SampleFormat::U8,
        AudioBufferRef::U16(_) => SampleFormat::U16,
        AudioBufferRef::U24(_) => SampleFormat::U24,
        AudioBufferRef::U32(_) => SampleFormat::U32,
        AudioBufferRef::S8(_) => SampleFormat::S8,
        AudioBufferRef::S16(_) => SampleFormat::S16,
        AudioBufferRef::S24(_) => SampleFormat::S24,
        AudioBufferRef::S32(_) => SampleFormat::S32,
        AudioBufferRef::F32(_) => SampleFormat::F32,
        AudioBufferRef::F64(_) => SampleFormat::F64,
    }
}

/// Native format announced by the codec parameters, before the first frame.
fn input_format_from_params(params: &CodecParameters) -> Result<InputFormat> {
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let channel_layout = params
        .channels
        .map(|c| ChannelLayout::from_bits(c.bits()))
        .ok_or_else(|| anyhow!("Unknown channels"))?;
    let sample_format = decoder_sample_format(params);
    Ok(InputFormat {
        channel_layout,
        sample_format,
        sample_rate,
    })
}

/// Sample format of the buffers the codec's decoder will produce.
///
/// Demuxers often leave `sample_format` unset (WAV does), so the codec type
/// decides first and the parameter is only a fallback.
fn decoder_sample_format(params: &CodecParameters) -> SampleFormat {
    use symphonia::core::codecs::*;
    use symphonia::core::sample::SampleFormat as Native;
    match params.codec {
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => SampleFormat::S32,
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => SampleFormat::S24,
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => SampleFormat::S16,
        CODEC_TYPE_PCM_S8 => SampleFormat::S8,
        CODEC_TYPE_PCM_U32LE | CODEC_TYPE_PCM_U32BE => SampleFormat::U32,
        CODEC_TYPE_PCM_U24LE | CODEC_TYPE_PCM_U24BE => SampleFormat::U24,
        CODEC_TYPE_PCM_U16LE | CODEC_TYPE_PCM_U16BE => SampleFormat::U16,
        CODEC_TYPE_PCM_U8 => SampleFormat::U8,
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => SampleFormat::F32,
        CODEC_TYPE_PCM_F64LE | CODEC_TYPE_PCM_F64BE => SampleFormat::F64,
        CODEC_TYPE_PCM_ALAW | CODEC_TYPE_PCM_MULAW => SampleFormat::S16,
        CODEC_TYPE_FLAC | CODEC_TYPE_ALAC | CODEC_TYPE_ADPCM_MS | CODEC_TYPE_ADPCM_IMA_WAV => {
            SampleFormat::S32
        }
        CODEC_TYPE_MP1 | CODEC_TYPE_MP2 | CODEC_TYPE_MP3 | CODEC_TYPE_AAC | CODEC_TYPE_VORBIS => {
            SampleFormat::F32
        }
        _ => match params.sample_format {
            Some(Native::U8) => SampleFormat::U8,
            Some(Native::U16) => SampleFormat::U16,
            Some(Native::U24) => SampleFormat::U24,
            Some(Native::U32) => SampleFormat::U32,
            Some(Native::S8) => SampleFormat::S8,
            Some(Native::S16) => SampleFormat::S16,
            Some(Native::S24) => SampleFormat::S24,
            Some(Native::S32) => SampleFormat::S32,
            Some(Native::F64) => SampleFormat::F64,
            Some(Native::F32) | None => SampleFormat::F32,
        },
    }
}

/// Best-effort duration in milliseconds from codec metadata.
fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label for logs.
fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::WatchdogTimeouts;
    use crate::test_support::{temp_path, write_wav};
    use crate::watchdog::Watchdog;
    use symphonia::core::audio::Channels;
    use symphonia::core::codecs::*;

    fn hook() -> InterruptHook {
        InterruptHook::new(Arc::new(Watchdog::new(WatchdogTimeouts::default())))
    }

    #[test]
    fn duration_ms_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_ms_from_codec_params(&params).is_none());
    }

    #[test]
    fn duration_ms_from_codec_params_computes() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(48_000);
        params.n_frames = Some(96_000);
        assert_eq!(duration_ms_from_codec_params(&params), Some(2000));
    }

    #[test]
    fn codec_name_from_params_maps_known_codecs() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_FLAC;
        assert_eq!(codec_name_from_params(&params), Some("FLAC"));
        params.codec = CODEC_TYPE_PCM_S16LE;
        assert_eq!(codec_name_from_params(&params), Some("PCM_S16"));
        assert!(codec_name_from_params(&CodecParameters::new()).is_none());
    }

    #[test]
    fn infer_ext_from_url_handles_query_and_missing_ext() {
        assert_eq!(
            infer_ext_from_url("http://example/a.flac?x=1"),
            Some("flac".to_string())
        );
        assert_eq!(infer_ext_from_url("http://example/a"), None);
        assert_eq!(
            infer_ext_from_url("http://example/archive.track.MP3"),
            Some("mp3".to_string())
        );
    }

    #[test]
    fn detects_http_urls() {
        assert!(is_http_url("http://radio.example/live"));
        assert!(is_http_url("HTTPS://radio.example/live.aac"));
        assert!(!is_http_url("/music/http.mp3"));
        assert!(!is_http_url("ftp://example/a.mp3"));
    }

    #[test]
    fn input_format_from_params_requires_rate_and_channels() {
        let mut params = CodecParameters::new();
        assert!(input_format_from_params(&params).is_err());
        params.sample_rate = Some(44_100);
        assert!(input_format_from_params(&params).is_err());
        params.channels = Some(Channels::FRONT_LEFT | Channels::FRONT_RIGHT);
        let format = input_format_from_params(&params).unwrap();
        assert_eq!(format.channels(), 2);
        assert_eq!(format.sample_rate, 44_100);
    }

    #[test]
    fn layouts_use_symphonia_channel_bits() {
        assert_eq!(ChannelLayout::MONO.bits(), Channels::FRONT_LEFT.bits());
        assert_eq!(
            ChannelLayout::STEREO.bits(),
            (Channels::FRONT_LEFT | Channels::FRONT_RIGHT).bits()
        );
    }

    #[test]
    fn sample_format_follows_the_codec_before_the_parameter() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_PCM_S16LE;
        assert_eq!(decoder_sample_format(&params), SampleFormat::S16);
        params.codec = CODEC_TYPE_PCM_U8;
        assert_eq!(decoder_sample_format(&params), SampleFormat::U8);
        params.codec = CODEC_TYPE_FLAC;
        params.sample_format = Some(symphonia::core::sample::SampleFormat::S16);
        assert_eq!(decoder_sample_format(&params), SampleFormat::S32);
        params.codec = CODEC_TYPE_MP3;
        assert_eq!(decoder_sample_format(&params), SampleFormat::F32);
        params.codec = CODEC_TYPE_NULL;
        assert_eq!(decoder_sample_format(&params), SampleFormat::S16);
    }

    #[test]
    fn setup_format_matches_the_first_decoded_frame() {
        for (channels, layout) in [(1, ChannelLayout::MONO), (2, ChannelLayout::STEREO)] {
            let path = temp_path(&format!("setup-key-{channels}.wav"));
            write_wav(&path, channels, 44_100, 2_048);
            let backend = SymphoniaBackend::default();

            let mut input = backend.open_input(path.to_str().unwrap(), hook()).unwrap();
            input.find_stream_info().unwrap();
            let (_, mut decoder) = input.open_best_audio_decoder().unwrap();
            let announced = decoder.input_format();
            assert_eq!(announced.channel_layout, layout);

            let packet = input.read_packet().unwrap().unwrap();
            let mut frame = DecodedFrame::default();
            let outcome = decoder.decode(packet.ts, &packet.data, &mut frame).unwrap();
            assert!(outcome.got_frame);
            assert_eq!(frame.format, Some(announced));
            let _ = std::fs::remove_file(&path);
        }
    }

    #[test]
    fn decodes_a_wav_file() {
        let path = temp_path("decode.wav");
        write_wav(&path, 2, 22_050, 4_410);
        let backend = SymphoniaBackend::default();

        let mut input = backend.open_input(path.to_str().unwrap(), hook()).unwrap();
        input.find_stream_info().unwrap();
        assert!(input.find_stream_info().is_err());
        let (stream, mut decoder) = input.open_best_audio_decoder().unwrap();
        assert_eq!(decoder.input_format().sample_rate, 22_050);
        assert_eq!(decoder.input_format().channels(), 2);

        let mut frame = DecodedFrame::default();
        let mut frames = 0;
        while let Some(packet) = input.read_packet().unwrap() {
            assert_eq!(packet.stream, stream);
            let outcome = decoder.decode(packet.ts, &packet.data, &mut frame).unwrap();
            assert_eq!(outcome.consumed, packet.data.len());
            if outcome.got_frame {
                assert_eq!(frame.samples.len(), frame.frames * 2);
                assert_eq!(frame.format.unwrap().sample_format, SampleFormat::S16);
                frames += frame.frames;
            }
        }
        assert_eq!(frames, 4_410);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_an_error() {
        let backend = SymphoniaBackend::default();
        assert!(backend.open_input("/nonexistent/clip.wav", hook()).is_err());
    }
}
