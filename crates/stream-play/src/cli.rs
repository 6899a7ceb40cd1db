use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "stream-play", version)]
pub struct Args {
    /// Local file path or http(s) URL to play
    pub source: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Output channel count
    #[arg(long, default_value_t = 1)]
    pub channels: u16,

    /// Output sample rate in Hz
    #[arg(long, default_value_t = 16_000)]
    pub rate: u32,

    /// Output bits per sample (16 or 32)
    #[arg(long, default_value_t = 16, value_parser = parse_bits)]
    pub bits: u16,

    /// Where converted PCM goes
    #[arg(long, value_enum, default_value_t = OutputKind::Null)]
    pub output: OutputKind,

    /// Raw PCM destination for `--output file`
    #[arg(long)]
    pub output_file: Option<PathBuf>,

    /// Use a specific output device by substring match (`--output device`)
    #[arg(long)]
    pub device: Option<String>,

    /// Device queue target in seconds
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,

    /// How many times to play the source
    #[arg(long, default_value_t = 100)]
    pub repeat: u32,

    /// Pause between plays in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub pause_between_ms: u64,

    /// Limit for opening the input in milliseconds
    #[arg(long, default_value_t = 30_000)]
    pub open_timeout_ms: u64,

    /// Limit for probing stream headers in milliseconds
    #[arg(long, default_value_t = 4_000)]
    pub header_timeout_ms: u64,

    /// Limit for reading a single packet in milliseconds
    #[arg(long, default_value_t = 5_000)]
    pub frame_timeout_ms: u64,

    /// Resampler input chunk size in frames
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputKind {
    /// Discard PCM, log totals
    Null,
    /// Play on an audio device
    Device,
    /// Append raw PCM to a file
    File,
}

fn parse_bits(s: &str) -> Result<u16, String> {
    match s.parse::<u16>() {
        Ok(bits @ (16 | 32)) => Ok(bits),
        Ok(bits) => Err(format!("{bits}-bit output is not supported (use 16 or 32)")),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_output() {
        let args = Args::parse_from(["stream-play", "song.mp3"]);
        assert_eq!(args.source.as_deref(), Some("song.mp3"));
        assert_eq!((args.channels, args.rate, args.bits), (1, 16_000, 16));
        assert_eq!(args.output, OutputKind::Null);
        assert_eq!(args.repeat, 100);
        assert_eq!(args.frame_timeout_ms, 5_000);
    }

    #[test]
    fn parses_file_output() {
        let args = Args::parse_from([
            "stream-play",
            "--output",
            "file",
            "--output-file",
            "out.pcm",
            "--repeat",
            "2",
            "http://host/a.mp3",
        ]);
        assert_eq!(args.output, OutputKind::File);
        assert_eq!(args.output_file, Some(PathBuf::from("out.pcm")));
        assert_eq!(args.repeat, 2);
    }

    #[test]
    fn bits_accepts_only_supported_depths() {
        let args = Args::parse_from(["stream-play", "--bits", "32", "a.wav"]);
        assert_eq!(args.bits, 32);
        assert!(Args::try_parse_from(["stream-play", "--bits", "8", "a.wav"]).is_err());
        assert!(Args::try_parse_from(["stream-play", "--bits", "24", "a.wav"]).is_err());
        assert!(Args::try_parse_from(["stream-play", "--bits", "sixteen", "a.wav"]).is_err());
    }
}
