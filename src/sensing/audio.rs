use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    path::Path,
    sync::mpsc::{self, TryRecvError},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::{
    db::{Artifact, AudioSegment},
    error::CaptureError,
    storage::{next_free_path, ArtifactDir, ArtifactLayout},
};

use super::{sampler::SampleSource, SourceKind, TaskTag};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error};

const WAV_HEADER_BYTES: u64 = 44;
const BYTES_PER_SAMPLE: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    fn frames(&self, samples: usize) -> usize {
        samples / usize::from(self.channels.max(1))
    }

    fn duration_of(&self, samples: usize) -> Duration {
        Duration::from_secs_f64(self.frames(samples) as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// Polled microphone capture delivering interleaved 16-bit PCM.
pub trait AudioRecorder: Send + 'static {
    fn open(&mut self) -> Result<AudioFormat>;

    /// Everything captured since the previous call, possibly empty.
    fn read_available(&mut self) -> Result<Vec<i16>>;
}

/// Push side of a [`CallbackAudioRecorder`]; hand it to the device's
/// capture callback. Dropping it disconnects the recorder.
#[derive(Clone)]
pub struct AudioChunkSender {
    sender: mpsc::Sender<Vec<i16>>,
}

impl AudioChunkSender {
    /// Returns false once the recorder is gone.
    pub fn push(&self, chunk: &[i16]) -> bool {
        self.sender.send(chunk.to_vec()).is_ok()
    }
}

/// Adapts callback-style PCM delivery to the polled [`AudioRecorder`].
pub struct CallbackAudioRecorder {
    format: AudioFormat,
    chunks: mpsc::Receiver<Vec<i16>>,
}

impl CallbackAudioRecorder {
    pub fn new(format: AudioFormat) -> (Self, AudioChunkSender) {
        let (sender, chunks) = mpsc::channel();
        (Self { format, chunks }, AudioChunkSender { sender })
    }
}

impl AudioRecorder for CallbackAudioRecorder {
    fn open(&mut self) -> Result<AudioFormat> {
        Ok(self.format)
    }

    fn read_available(&mut self) -> Result<Vec<i16>> {
        let mut samples = Vec::new();
        loop {
            match self.chunks.try_recv() {
                Ok(chunk) => samples.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if samples.is_empty() {
                        return Err(CaptureError::disconnected(
                            SourceKind::Microphone,
                            "capture callback closed",
                        )
                        .into());
                    }
                    break;
                }
            }
        }
        Ok(samples)
    }
}

/// Root-mean-square level of 16-bit samples, scaled to [0, 1].
pub fn rms_level(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let value = f64::from(sample);
            value * value
        })
        .sum();
    let rms = (sum_squares / samples.len() as f64).sqrt() / 32768.0;
    rms.clamp(0.0, 1.0)
}

/// Writes a 16-bit PCM WAV file and returns its size in bytes. Refuses to
/// overwrite an existing file.
pub fn write_wav(path: &Path, format: AudioFormat, samples: &[i16]) -> Result<u64> {
    let data_len = samples.len() as u64 * u64::from(BYTES_PER_SAMPLE);
    let riff_len = u32::try_from(36 + data_len).context("audio segment too large for WAV")?;
    let data_len_u32 = u32::try_from(data_len).context("audio segment too large for WAV")?;
    let block_align = format.channels * BYTES_PER_SAMPLE;
    let byte_rate = format.sample_rate * u32::from(block_align);

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("failed to create audio file {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    writer.write_all(b"RIFF")?;
    writer.write_all(&riff_len.to_le_bytes())?;
    writer.write_all(b"WAVE")?;
    writer.write_all(b"fmt ")?;
    writer.write_all(&16u32.to_le_bytes())?;
    writer.write_all(&1u16.to_le_bytes())?;
    writer.write_all(&format.channels.to_le_bytes())?;
    writer.write_all(&format.sample_rate.to_le_bytes())?;
    writer.write_all(&byte_rate.to_le_bytes())?;
    writer.write_all(&block_align.to_le_bytes())?;
    writer.write_all(&(BYTES_PER_SAMPLE * 8).to_le_bytes())?;
    writer.write_all(b"data")?;
    writer.write_all(&data_len_u32.to_le_bytes())?;
    for sample in samples {
        writer.write_all(&sample.to_le_bytes())?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush audio file {}", path.display()))?;

    Ok(WAV_HEADER_BYTES + data_len)
}

/// Cuts the recorder's stream into fixed-duration WAV segments.
pub struct AudioSegmenter {
    recorder: Box<dyn AudioRecorder>,
    session_id: i64,
    layout: ArtifactLayout,
    task_tag: TaskTag,
    segment_duration: Duration,
    format: Option<AudioFormat>,
    pending: Vec<i16>,
    segment_start: Option<DateTime<Utc>>,
}

impl AudioSegmenter {
    pub fn new(
        recorder: Box<dyn AudioRecorder>,
        session_id: i64,
        layout: ArtifactLayout,
        task_tag: TaskTag,
        segment_duration: Duration,
    ) -> Self {
        Self {
            recorder,
            session_id,
            layout,
            task_tag,
            segment_duration,
            format: None,
            pending: Vec::new(),
            segment_start: None,
        }
    }

    fn segment_samples(&self, format: AudioFormat) -> usize {
        let frames = (self.segment_duration.as_secs_f64() * f64::from(format.sample_rate)).round();
        (frames as usize).max(1) * usize::from(format.channels)
    }

    /// Writes one segment. A taken file name gets a numbered sibling rather
    /// than failing the segment.
    fn finalize(
        &self,
        format: AudioFormat,
        samples: &[i16],
        start: DateTime<Utc>,
    ) -> Result<AudioSegment> {
        let duration = format.duration_of(samples.len());
        let end = start + chrono::Duration::from_std(duration)?;

        self.layout.ensure_dir(self.session_id, ArtifactDir::Audio)?;
        let path = next_free_path(&self.layout.audio_path(self.session_id, &start));
        let byte_size = write_wav(&path, format, samples)?;

        log_debug!(
            "audio segment {:.2}s written to {}",
            duration.as_secs_f64(),
            path.display()
        );

        Ok(AudioSegment {
            session_id: self.session_id,
            start_timestamp: start,
            end_timestamp: end,
            duration_secs: duration.as_secs_f64(),
            storage_path: path.to_string_lossy().into_owned(),
            sample_rate: format.sample_rate,
            channels: format.channels,
            byte_size,
            rms_level: rms_level(samples),
            task_tag: self.task_tag.get(),
        })
    }
}

impl SampleSource for AudioSegmenter {
    type Output = Artifact;

    fn kind(&self) -> SourceKind {
        SourceKind::Microphone
    }

    fn open(&mut self) -> Result<()> {
        let format = self.recorder.open()?;
        if format.sample_rate == 0 || format.channels == 0 {
            bail!(
                "unsupported audio format: {} Hz, {} channels",
                format.sample_rate,
                format.channels
            );
        }
        self.format = Some(format);
        Ok(())
    }

    /// Cuts every complete segment. Samples are only released once their
    /// segment is on disk; a failed write leaves them pending for the next
    /// poll, and segments already written in this poll are still returned.
    fn poll(&mut self, now: DateTime<Utc>) -> Result<Vec<Artifact>> {
        let Some(format) = self.format else {
            bail!("audio recorder polled before open");
        };

        let samples = self.recorder.read_available()?;
        if !samples.is_empty() {
            if self.segment_start.is_none() {
                let received = chrono::Duration::from_std(format.duration_of(samples.len()))?;
                self.segment_start = Some(now - received);
            }
            self.pending.extend_from_slice(&samples);
        }

        let per_segment = self.segment_samples(format);
        let mut finished = Vec::new();
        while self.pending.len() >= per_segment {
            let start = self.segment_start.unwrap_or(now);
            match self.finalize(format, &self.pending[..per_segment], start) {
                Ok(segment) => {
                    self.pending.drain(..per_segment);
                    self.segment_start = Some(segment.end_timestamp);
                    finished.push(Artifact::Audio(segment));
                }
                Err(err) if finished.is_empty() => return Err(err),
                Err(err) => {
                    log_error!("audio segment starting {start} kept for retry: {err:#}");
                    break;
                }
            }
        }
        Ok(finished)
    }

    /// Writes everything still pending, full segments first, then the
    /// partial tail.
    fn finish(&mut self, now: DateTime<Utc>) -> Result<Vec<Artifact>> {
        let Some(format) = self.format else {
            return Ok(Vec::new());
        };

        // Pick up anything delivered since the last poll.
        if let Ok(samples) = self.recorder.read_available() {
            self.pending.extend_from_slice(&samples);
        }
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut start = match self.segment_start {
            Some(start) => start,
            None => now - chrono::Duration::from_std(format.duration_of(self.pending.len()))?,
        };
        let per_segment = self.segment_samples(format);
        let mut finished = Vec::new();
        while !self.pending.is_empty() {
            let len = self.pending.len().min(per_segment);
            match self.finalize(format, &self.pending[..len], start) {
                Ok(segment) => {
                    self.pending.drain(..len);
                    start = segment.end_timestamp;
                    finished.push(Artifact::Audio(segment));
                }
                Err(err) if finished.is_empty() => return Err(err),
                Err(err) => {
                    log_error!(
                        "{} audio samples could not be written at stop: {err:#}",
                        self.pending.len()
                    );
                    break;
                }
            }
        }
        self.segment_start = None;
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::TempDir;

    const MONO_8K: AudioFormat = AudioFormat {
        sample_rate: 8_000,
        channels: 1,
    };

    fn segmenter(dir: &TempDir, recorder: CallbackAudioRecorder) -> AudioSegmenter {
        AudioSegmenter::new(
            Box::new(recorder),
            3,
            ArtifactLayout::new(dir.path()),
            TaskTag::new(),
            Duration::from_secs(1),
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn rms_of_silence_and_full_scale() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[0, 0, 0]), 0.0);
        let full = rms_level(&[i16::MIN, i16::MIN]);
        assert_eq!(full, 1.0);
        let half = rms_level(&[16_384, -16_384]);
        assert!((half - 0.5).abs() < 1e-9);
    }

    #[test]
    fn wav_header_matches_payload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tone.wav");
        let format = AudioFormat {
            sample_rate: 16_000,
            channels: 2,
        };
        let size = write_wav(&path, format, &[1, -1, 2, -2]).unwrap();
        assert_eq!(size, 44 + 8);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, size);
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        assert_eq!(u16::from_le_bytes([bytes[22], bytes[23]]), 2);
        assert_eq!(
            u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            16_000
        );
        assert_eq!(u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]), 8);
        assert!(write_wav(&path, format, &[0]).is_err());
    }

    #[test]
    fn full_segments_are_cut_and_partial_flushed_on_finish() {
        let dir = TempDir::new().unwrap();
        let (recorder, sender) = CallbackAudioRecorder::new(MONO_8K);
        let mut segmenter = segmenter(&dir, recorder);
        segmenter.open().unwrap();

        sender.push(&vec![1000; 6_000]);
        assert!(segmenter.poll(t0()).unwrap().is_empty());

        sender.push(&vec![1000; 6_000]);
        let finished = segmenter.poll(t0() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(finished.len(), 1);
        let Artifact::Audio(first) = &finished[0] else {
            panic!("expected audio artifact");
        };
        assert_eq!(first.duration_secs, 1.0);
        assert_eq!(first.byte_size, 44 + 16_000);
        assert!((first.rms_level - 1000.0 / 32768.0).abs() < 1e-9);

        let rest = segmenter.finish(t0() + chrono::Duration::seconds(2)).unwrap();
        assert_eq!(rest.len(), 1);
        let Artifact::Audio(partial) = &rest[0] else {
            panic!("expected audio artifact");
        };
        assert_eq!(partial.duration_secs, 0.5);
        assert_eq!(partial.start_timestamp, first.end_timestamp);
        assert!(Path::new(&partial.storage_path).exists());
    }

    #[test]
    fn finish_without_audio_emits_nothing() {
        let dir = TempDir::new().unwrap();
        let (recorder, _sender) = CallbackAudioRecorder::new(MONO_8K);
        let mut segmenter = segmenter(&dir, recorder);
        segmenter.open().unwrap();
        assert!(segmenter.poll(t0()).unwrap().is_empty());
        assert!(segmenter.finish(t0()).unwrap().is_empty());
    }

    #[test]
    fn dropped_callback_reads_as_disconnect() {
        let (mut recorder, sender) = CallbackAudioRecorder::new(MONO_8K);
        sender.push(&[1, 2, 3]);
        drop(sender);

        assert_eq!(recorder.read_available().unwrap(), vec![1, 2, 3]);
        let err = recorder.read_available().unwrap_err();
        assert!(matches!(
            CaptureError::classify(&err),
            Some(CaptureError::DeviceDisconnected { .. })
        ));
    }

    fn durations(artifacts: &[Artifact]) -> Vec<f64> {
        artifacts
            .iter()
            .map(|artifact| match artifact {
                Artifact::Audio(segment) => segment.duration_secs,
                other => panic!("expected audio artifact, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn taken_segment_name_does_not_lose_audio() {
        let dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let (recorder, sender) = CallbackAudioRecorder::new(MONO_8K);
        let mut segmenter = segmenter(&dir, recorder);
        segmenter.open().unwrap();

        // 2.5 s arrive in one poll, so the first segment starts 2.5 s back.
        let second_start = t0() - chrono::Duration::milliseconds(1_500);
        layout.ensure_dir(3, ArtifactDir::Audio).unwrap();
        fs::write(layout.audio_path(3, &second_start), b"taken").unwrap();

        sender.push(&vec![500; 20_000]);
        let finished = segmenter.poll(t0()).unwrap();
        assert_eq!(durations(&finished), vec![1.0, 1.0]);
        let Artifact::Audio(second) = &finished[1] else {
            unreachable!()
        };
        assert_eq!(second.start_timestamp, second_start);
        assert!(second.storage_path.ends_with("_1.wav"));
        assert_eq!(fs::read(layout.audio_path(3, &second_start)).unwrap(), b"taken");

        let rest = segmenter.finish(t0()).unwrap();
        assert_eq!(durations(&rest), vec![0.5]);
    }

    #[test]
    fn failed_write_keeps_samples_pending() {
        let dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let (recorder, sender) = CallbackAudioRecorder::new(MONO_8K);
        let mut segmenter = segmenter(&dir, recorder);
        segmenter.open().unwrap();

        // A plain file where the audio directory belongs fails every write.
        fs::create_dir_all(layout.session_dir(3)).unwrap();
        let blocker = layout.dir(3, ArtifactDir::Audio);
        fs::write(&blocker, b"not a directory").unwrap();

        sender.push(&vec![500; 20_000]);
        assert!(segmenter.poll(t0()).is_err());
        assert_eq!(segmenter.pending.len(), 20_000);

        fs::remove_file(&blocker).unwrap();
        let finished = segmenter.poll(t0() + chrono::Duration::milliseconds(100)).unwrap();
        assert_eq!(durations(&finished), vec![1.0, 1.0]);
        let Artifact::Audio(first) = &finished[0] else {
            unreachable!()
        };
        assert_eq!(first.start_timestamp, t0() - chrono::Duration::milliseconds(2_500));

        let rest = segmenter.finish(t0() + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(durations(&rest), vec![0.5]);
        assert!(segmenter.pending.is_empty());
    }

    #[test]
    fn finish_writes_backlog_in_full_segments() {
        let dir = TempDir::new().unwrap();
        let layout = ArtifactLayout::new(dir.path());
        let (recorder, sender) = CallbackAudioRecorder::new(MONO_8K);
        let mut segmenter = segmenter(&dir, recorder);
        segmenter.open().unwrap();

        fs::create_dir_all(layout.session_dir(3)).unwrap();
        let blocker = layout.dir(3, ArtifactDir::Audio);
        fs::write(&blocker, b"not a directory").unwrap();
        sender.push(&vec![500; 20_000]);
        assert!(segmenter.poll(t0()).is_err());
        fs::remove_file(&blocker).unwrap();

        let rest = segmenter.finish(t0()).unwrap();
        assert_eq!(durations(&rest), vec![1.0, 1.0, 0.5]);
    }
}
