//! Container files written through FFmpeg's muxers

use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::format::muxer::{Muxer, OutputFormat};
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::{TimeBase as AvTimeBase, Timestamp as AvTimestamp};
use log::{debug, info};
use std::fs::File;

use super::{ContainerSink, MuxConfig, MuxStats};
use crate::encoder::ffmpeg::FfmpegParameters;
use crate::error::{Error, Result};
use crate::pipeline::types::{EncodedPacket, TrackParameters};

/// Writes an mp4/mkv/... file; the format follows the file extension unless
/// `mux.format` names one
pub struct FfmpegFileSink {
    muxer: Option<Muxer<File>>,
    /// Stream index per media kind
    streams: [Option<usize>; 2],
    stats: MuxStats,
}

// The muxer is only touched from the mux worker
unsafe impl Send for FfmpegFileSink {}

impl FfmpegFileSink {
    pub fn new() -> Self {
        Self {
            muxer: None,
            streams: [None; 2],
            stats: MuxStats::default(),
        }
    }
}

impl Default for FfmpegFileSink {
    fn default() -> Self {
        Self::new()
    }
}

fn output_format(config: &MuxConfig) -> Result<OutputFormat> {
    let path = config
        .output_path()
        .ok_or_else(|| Error::InvalidParameter("mux.output_path is not set".into()))?;

    match &config.format {
        Some(name) => OutputFormat::find_by_name(name)
            .ok_or_else(|| Error::Unsupported(format!("container format '{}'", name))),
        None => {
            let file_name = path.to_string_lossy();
            OutputFormat::guess_from_file_name(&file_name).ok_or_else(|| {
                Error::Unsupported(format!("no container format for '{}'", file_name))
            })
        }
    }
}

impl ContainerSink for FfmpegFileSink {
    fn open(&mut self, tracks: &[TrackParameters], config: &MuxConfig) -> Result<()> {
        if self.muxer.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let format = output_format(config)?;
        let Some(path) = config.output_path() else {
            return Err(Error::InvalidParameter("mux.output_path is not set".into()));
        };

        let mut builder = Muxer::builder();
        for track in tracks {
            let params = track
                .native
                .as_ref()
                .and_then(|native| native.downcast_ref::<FfmpegParameters>())
                .ok_or_else(|| {
                    Error::InvalidParameter(format!(
                        "{} track from {} has no FFmpeg codec parameters",
                        track.track, track.encoder
                    ))
                })?;
            let index = builder.add_stream(&params.0)?;
            self.streams[track.track.index()] = Some(index);
            debug!("FfmpegFileSink: stream {} is {} ({})", index, track.codec, track.track);
        }

        // Tags go on the first stream
        if let Some(stream) = builder.streams_mut().first_mut() {
            for (key, value) in config.metadata() {
                stream.set_metadata(key, value);
            }
        }

        let file = File::create(path)?;
        let io = IO::from_seekable_write_stream(file);
        self.muxer = Some(builder.build(io, format)?);
        info!("FfmpegFileSink: writing {}", path.display());
        Ok(())
    }

    fn write(&mut self, packet: EncodedPacket) -> Result<()> {
        let Some(muxer) = self.muxer.as_mut() else {
            return Err(Error::NotInitialized);
        };
        let Some(index) = self.streams[packet.track.index()] else {
            return Err(Error::InvalidParameter(format!(
                "no {} stream in the container",
                packet.track
            )));
        };

        let size = packet.size();
        let pts = AvTimestamp::new(packet.pts.micros, AvTimeBase::MICROSECONDS);
        let dts = AvTimestamp::new(packet.dts.micros, AvTimeBase::MICROSECONDS);
        let av_packet = PacketMut::from(packet.data.as_ref())
            .with_time_base(AvTimeBase::MICROSECONDS)
            .with_pts(pts)
            .with_dts(dts)
            .with_key_flag(packet.is_keyframe)
            .with_stream_index(index)
            .freeze();
        muxer.push(av_packet)?;

        self.stats.packets_written += 1;
        self.stats.bytes_written += size as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<MuxStats> {
        let Some(mut muxer) = self.muxer.take() else {
            return Ok(self.stats);
        };
        muxer.flush()?;
        muxer.close()?;
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::MediaKind;
    use std::path::PathBuf;

    #[test]
    fn test_missing_output_path() {
        let err = output_format(&MuxConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_unknown_named_format() {
        let config = MuxConfig {
            output_path: Some(PathBuf::from("out.bin")),
            format: Some("no-such-container".into()),
            ..Default::default()
        };
        assert!(matches!(output_format(&config), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_write_before_open() {
        let mut sink = FfmpegFileSink::new();
        let packet = EncodedPacket {
            track: MediaKind::Video,
            data: bytes::Bytes::from_static(&[0, 0, 0, 1]),
            pts: Default::default(),
            dts: Default::default(),
            duration: 0,
            is_keyframe: true,
        };
        assert!(matches!(sink.write(packet), Err(Error::NotInitialized)));
        assert_eq!(sink.finish().unwrap(), MuxStats::default());
    }
}
