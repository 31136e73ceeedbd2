//! H.264 encoder backed by an `ffmpeg`/libx264 child process.
//!
//! Raw frames go to ffmpeg's stdin as tightly packed `rawvideo`. A reader
//! thread forwards the Annex-B output to a splitter thread, which cuts it
//! into access units and hands each one to a [`UnitSink`]; `submit` and
//! `poll` drain the paired inbox on the capture thread. The first SPS/PPS
//! pair seen in the stream is published as the parameter-set blob.
//!
//! A frame of a new size (a display mode change, say) restarts ffmpeg at
//! that size; x264 repeats SPS/PPS in-band with every IDR, so the stream
//! stays decodable.

use std::collections::VecDeque;
use std::io::{self, BufWriter, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use framepipe_core::bitstream::{
    START_CODE, begins_access_unit, contains_picture, nal_type_after, split_access_units,
    start_codes,
};
use framepipe_core::{
    AccessUnit, PipelineError, PixelFormat, RawFrame, Result, UnitInbox, UnitSink, VideoEncoder,
    unit_channel,
};

const NAL_TYPE_SPS: u8 = 7;
const NAL_TYPE_PPS: u8 = 8;

/// Read size for ffmpeg's stdout.
const READ_CHUNK: usize = 64 * 1024;

/// Output silence after which a buffered picture counts as complete.
const QUIET_FLUSH: Duration = Duration::from_millis(2);

/// Everything needed to launch the encoder process.
#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub program: String,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub preset: String,
    pub gop: u32,
}

fn pix_fmt(format: PixelFormat) -> &'static str {
    match format {
        PixelFormat::Bgra8 => "bgra",
        PixelFormat::Rgba8 => "rgba",
        PixelFormat::Rgb8 => "rgb24",
    }
}

/// Command line for a low-latency raw → Annex-B H.264 transcode.
pub fn build_ffmpeg_args(settings: &FfmpegSettings) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-f", "rawvideo"]
        .into_iter()
        .map(String::from)
        .collect();

    args.extend([
        "-pix_fmt".into(),
        pix_fmt(settings.format).into(),
        "-s".into(),
        format!("{}x{}", settings.width, settings.height),
        "-r".into(),
        settings.fps.to_string(),
        "-i".into(),
        "-".into(),
        "-c:v".into(),
        "libx264".into(),
        "-preset".into(),
        settings.preset.clone(),
        "-tune".into(),
        "zerolatency".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        "-g".into(),
        settings.gop.to_string(),
        "-bf".into(),
        "0".into(),
        "-b:v".into(),
        format!("{}k", settings.bitrate_kbps),
        "-x264-params".into(),
        "aud=1".into(),
        "-flush_packets".into(),
        "1".into(),
        "-f".into(),
        "h264".into(),
        "-".into(),
    ]);
    args
}

// ── FfmpegEncoder ────────────────────────────────────────────────

pub struct FfmpegEncoder {
    settings: FfmpegSettings,
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    inbox: UnitInbox,
    stamps: TimestampQueue,
    threads: Vec<JoinHandle<()>>,
}

impl FfmpegEncoder {
    /// Spawn ffmpeg, its stdout reader and the access-unit splitter.
    pub fn spawn(settings: FfmpegSettings) -> Result<Self> {
        let args = build_ffmpeg_args(&settings);
        debug!(program = %settings.program, ?args, "spawning encoder");

        let mut child = Command::new(&settings.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                PipelineError::Initialization(format!("failed to start {}: {e}", settings.program))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(PipelineError::Initialization(
                "failed to open ffmpeg stdio".into(),
            ));
        };

        let (sink, inbox) = unit_channel();
        let (chunk_tx, chunk_rx) = mpsc::channel();
        let threads = spawn_output_threads(stdout, chunk_tx, chunk_rx, sink).map_err(|e| {
            let _ = child.kill();
            let _ = child.wait();
            PipelineError::Initialization(format!("spawn ffmpeg output threads: {e}"))
        })?;

        info!(
            width = settings.width,
            height = settings.height,
            fps = settings.fps,
            bitrate_kbps = settings.bitrate_kbps,
            "ffmpeg encoder started"
        );
        Ok(Self {
            stdin: Some(BufWriter::with_capacity(
                settings.width as usize * settings.height as usize * 4,
                stdin,
            )),
            settings,
            child,
            inbox,
            stamps: TimestampQueue::default(),
            threads,
        })
    }

    pub fn settings(&self) -> &FfmpegSettings {
        &self.settings
    }

    fn write_frame(&mut self, frame: &RawFrame) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "encoder input closed"))?;
        stdin.write_all(&frame.packed())?;
        stdin.flush()
    }

    /// Units delivered so far, each with the timestamp of its submission.
    fn collect(&mut self) -> Vec<AccessUnit> {
        self.inbox
            .drain()
            .into_iter()
            .map(|data| self.stamps.stamp(data))
            .collect()
    }

    /// Restart ffmpeg for a new input size. Returns what the old process
    /// still had buffered.
    fn resize(&mut self, width: u32, height: u32) -> Result<Vec<AccessUnit>> {
        info!(
            from = ?(self.settings.width, self.settings.height),
            to = ?(width, height),
            "input size changed; restarting encoder"
        );
        let settings = FfmpegSettings {
            width,
            height,
            ..self.settings.clone()
        };
        let mut old = std::mem::replace(self, Self::spawn(settings)?);
        old.finish();
        Ok(old.collect())
    }

    /// Close ffmpeg's input and wait for it to flush its output and exit.
    fn finish(&mut self) {
        drop(self.stdin.take());
        match self.child.wait() {
            Ok(status) => debug!(%status, "ffmpeg finished"),
            Err(e) => warn!(error = %e, "waiting for ffmpeg"),
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn submit(&mut self, frame: RawFrame, timestamp_us: u64) -> Result<Vec<AccessUnit>> {
        if frame.format != self.settings.format {
            return Err(PipelineError::Encode(format!(
                "frame format {:?} does not match encoder input {:?}",
                frame.format, self.settings.format,
            )));
        }
        frame.validate()?;

        let mut units = Vec::new();
        if (frame.width, frame.height) != (self.settings.width, self.settings.height) {
            units = self.resize(frame.width, frame.height)?;
        }

        if let Err(e) = self.write_frame(&frame) {
            return Err(PipelineError::Encode(format!("writing to ffmpeg: {e}")));
        }
        self.stamps.submitted(timestamp_us);

        units.extend(self.collect());
        if units.is_empty() && self.inbox.is_disconnected() {
            return Err(PipelineError::Encode("ffmpeg output closed".into()));
        }
        Ok(units)
    }

    fn poll(&mut self) -> Result<Vec<AccessUnit>> {
        Ok(self.collect())
    }

    fn parameter_sets(&self) -> Option<Bytes> {
        self.inbox.parameter_sets()
    }

    fn name(&self) -> &str {
        "ffmpeg-libx264"
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => debug!(%status, "ffmpeg exited"),
            Err(e) => warn!(error = %e, "waiting for ffmpeg"),
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

// ── Timestamps ───────────────────────────────────────────────────

/// Pairs delivered units with submission timestamps.
///
/// With `-bf 0` ffmpeg emits exactly one access unit per input frame, in
/// input order, so each unit that opens with a delimiter takes the oldest
/// outstanding timestamp. A fragment without one belongs to the unit
/// before it and shares its timestamp.
#[derive(Debug, Default)]
struct TimestampQueue {
    pending: VecDeque<u64>,
    current: u64,
}

impl TimestampQueue {
    fn submitted(&mut self, timestamp_us: u64) {
        self.pending.push_back(timestamp_us);
    }

    fn stamp(&mut self, data: Bytes) -> AccessUnit {
        if begins_access_unit(&data) {
            if let Some(timestamp_us) = self.pending.pop_front() {
                self.current = timestamp_us;
            }
        }
        AccessUnit::new(data, self.current)
    }
}

// ── Output threads ───────────────────────────────────────────────

fn spawn_output_threads(
    stdout: ChildStdout,
    chunk_tx: Sender<Bytes>,
    chunk_rx: Receiver<Bytes>,
    sink: UnitSink,
) -> io::Result<Vec<JoinHandle<()>>> {
    let reader = thread::Builder::new()
        .name("framepipe-ffmpeg-reader".into())
        .spawn(move || read_chunks(stdout, chunk_tx))?;
    let splitter = thread::Builder::new()
        .name("framepipe-ffmpeg-split".into())
        .spawn(move || pump_units(chunk_rx, sink, QUIET_FLUSH))?;
    Ok(vec![reader, splitter])
}

/// Forward ffmpeg's stdout in chunks until EOF.
fn read_chunks(mut stdout: impl Read, chunks: Sender<Bytes>) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match stdout.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "reading ffmpeg output");
                break;
            }
        };
        if chunks.send(Bytes::copy_from_slice(&chunk[..n])).is_err() {
            break;
        }
    }
    debug!("ffmpeg output ended");
}

/// Cut the Annex-B chunk stream into access units.
///
/// A unit is complete once the next delimiter arrives, or once the
/// stream has been quiet for `quiet` and the unit holds a picture, so the
/// newest picture is never held back waiting for the next one.
fn pump_units(chunks: Receiver<Bytes>, sink: UnitSink, quiet: Duration) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK * 4);
    let mut sets_published = false;

    let deliver = |unit: Bytes, sets_published: &mut bool| -> bool {
        if !*sets_published {
            if let Some(sets) = extract_parameter_sets(&unit) {
                sink.deliver_parameter_sets(sets);
                *sets_published = true;
            }
        }
        sink.deliver(unit)
    };

    loop {
        let next = if buf.is_empty() {
            chunks.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            chunks.recv_timeout(quiet)
        };

        match next {
            Ok(chunk) => {
                buf.extend_from_slice(&chunk);
                for unit in split_access_units(&mut buf) {
                    if !deliver(unit, &mut sets_published) {
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if contains_picture(&buf) && !deliver(buf.split().freeze(), &mut sets_published) {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !buf.is_empty() {
        deliver(buf.split().freeze(), &mut sets_published);
    }
}

/// SPS and PPS units of `data`, start-code delimited, if both are present.
pub fn extract_parameter_sets(data: &[u8]) -> Option<Bytes> {
    let codes: Vec<_> = start_codes(data).collect();
    let mut out = BytesMut::new();
    let (mut sps, mut pps) = (false, false);

    for (i, code) in codes.iter().enumerate() {
        let nal_type = nal_type_after(data, code);
        if nal_type != Some(NAL_TYPE_SPS) && nal_type != Some(NAL_TYPE_PPS) {
            continue;
        }
        let end = codes.get(i + 1).map_or(data.len(), |next| next.offset);
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&data[code.payload_offset()..end]);
        sps |= nal_type == Some(NAL_TYPE_SPS);
        pps |= nal_type == Some(NAL_TYPE_PPS);
    }

    (sps && pps).then(|| out.freeze())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const AUD: &[u8] = &[0, 0, 0, 1, 0x09, 0xF0];
    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1F];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xCE];
    const IDR: &[u8] = &[0, 0, 1, 0x65, 0x88, 0x84];
    const SLICE: &[u8] = &[0, 0, 1, 0x41, 0x9A];

    fn settings() -> FfmpegSettings {
        FfmpegSettings {
            program: "ffmpeg".into(),
            width: 1280,
            height: 720,
            format: PixelFormat::Bgra8,
            fps: 30,
            bitrate_kbps: 5000,
            preset: "ultrafast".into(),
            gop: 30,
        }
    }

    fn window(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
    }

    #[test]
    fn args_describe_raw_input_and_annex_b_output() {
        let args = build_ffmpeg_args(&settings());
        assert_eq!(window(&args, "-s").as_deref(), Some("1280x720"));
        assert_eq!(window(&args, "-r").as_deref(), Some("30"));
        assert_eq!(window(&args, "-b:v").as_deref(), Some("5000k"));
        assert_eq!(window(&args, "-x264-params").as_deref(), Some("aud=1"));
        assert_eq!(window(&args, "-f").as_deref(), Some("rawvideo"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
        assert!(args.iter().any(|a| a == "zerolatency"));
    }

    #[test]
    fn parameter_sets_extracted_in_order() {
        let au = [AUD, SPS, PPS, IDR].concat();
        let sets = extract_parameter_sets(&au).unwrap();
        assert_eq!(&sets[..], &[SPS, PPS].concat()[..]);
    }

    #[test]
    fn parameter_sets_need_both_units() {
        let au = [AUD, SPS, IDR].concat();
        assert!(extract_parameter_sets(&au).is_none());
        assert!(extract_parameter_sets(&[AUD, SLICE].concat()).is_none());
    }

    fn feed(chunks: &[&[u8]]) -> Receiver<Bytes> {
        let (tx, rx) = mpsc::channel();
        for chunk in chunks {
            tx.send(Bytes::copy_from_slice(chunk)).unwrap();
        }
        rx
    }

    #[test]
    fn pump_splits_on_delimiters() {
        let stream = [AUD, SPS, PPS, IDR, AUD, SLICE, AUD, SLICE].concat();
        let (sink, mut inbox) = unit_channel();
        pump_units(feed(&[&stream]), sink, QUIET_FLUSH);

        let units = inbox.drain();
        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], &[AUD, SPS, PPS, IDR].concat()[..]);
        assert_eq!(&units[1][..], &[AUD, SLICE].concat()[..]);
        assert_eq!(&units[2][..], &[AUD, SLICE].concat()[..]);
        assert_eq!(&inbox.parameter_sets().unwrap()[..], &[SPS, PPS].concat()[..]);
        assert!(inbox.is_disconnected());
    }

    #[test]
    fn quiet_output_releases_the_newest_picture() {
        let (tx, rx) = mpsc::channel();
        let (sink, mut inbox) = unit_channel();
        let splitter = thread::spawn(move || pump_units(rx, sink, QUIET_FLUSH));

        // Delimiter and slice in separate writes; no following delimiter.
        tx.send(Bytes::from_static(AUD)).unwrap();
        tx.send(Bytes::from_static(SLICE)).unwrap();

        let units = inbox.drain_timeout(Duration::from_secs(2));
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], &[AUD, SLICE].concat()[..]);

        drop(tx);
        splitter.join().unwrap();
    }

    #[test]
    fn quiet_output_without_a_picture_is_held() {
        let (tx, rx) = mpsc::channel();
        let (sink, mut inbox) = unit_channel();
        let splitter = thread::spawn(move || pump_units(rx, sink, QUIET_FLUSH));

        tx.send(Bytes::from_static(AUD)).unwrap();
        assert!(inbox.drain_timeout(Duration::from_millis(30)).is_empty());

        tx.send(Bytes::from_static(SLICE)).unwrap();
        assert_eq!(inbox.drain_timeout(Duration::from_secs(2)).len(), 1);

        drop(tx);
        splitter.join().unwrap();
    }

    #[test]
    fn units_take_submission_timestamps_in_order() {
        let mut stamps = TimestampQueue::default();
        stamps.submitted(100);
        stamps.submitted(200);

        let first = stamps.stamp(Bytes::from([AUD, IDR].concat()));
        let fragment = stamps.stamp(Bytes::from_static(SLICE));
        let second = stamps.stamp(Bytes::from([AUD, SLICE].concat()));
        assert_eq!(
            (first.timestamp_us, fragment.timestamp_us, second.timestamp_us),
            (100, 100, 200)
        );
    }

    // ── Against a stand-in process ───────────────────────────────

    /// Executable shell script that takes ffmpeg's place.
    #[cfg(unix)]
    fn stand_in(tag: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!(
            "framepipe-ffmpeg-{tag}-{}",
            std::process::id()
        ));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    fn spawn_stand_in(program: String, width: u32, height: u32) -> FfmpegEncoder {
        let settings = FfmpegSettings {
            program,
            width,
            height,
            ..settings()
        };
        // A script written a moment ago can still be busy for exec while
        // another test thread forks.
        for _ in 0..50 {
            match FfmpegEncoder::spawn(settings.clone()) {
                Ok(encoder) => return encoder,
                Err(e) if e.to_string().contains("busy") => {
                    thread::sleep(Duration::from_millis(10))
                }
                Err(e) => panic!("spawn stand-in: {e}"),
            }
        }
        panic!("stand-in stayed busy");
    }

    /// A 4×1 BGRA frame whose 16 bytes are one Annex-B access unit.
    #[cfg(unix)]
    fn unit_frame(unit: &[u8]) -> RawFrame {
        let mut data = [AUD, unit].concat();
        data.resize(16, 0x80);
        RawFrame {
            width: 4,
            height: 1,
            stride: 16,
            format: PixelFormat::Bgra8,
            data,
            timestamp_us: 0,
        }
    }

    #[cfg(unix)]
    fn poll_until_output(encoder: &mut FfmpegEncoder) -> Vec<AccessUnit> {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let units = encoder.poll().unwrap();
            if !units.is_empty() || std::time::Instant::now() > deadline {
                return units;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[cfg(unix)]
    #[test]
    fn echoed_units_keep_their_timestamps_and_arrive_while_idle() {
        let program = stand_in("echo", "exec cat");
        let mut encoder = spawn_stand_in(program, 4, 1);

        let returned = encoder.submit(unit_frame(IDR), 1_000).unwrap();
        let mut units = returned;
        units.extend(poll_until_output(&mut encoder));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].timestamp_us, 1_000);
        assert!(framepipe_core::bitstream::detect_keyframe(&units[0].data));

        let mut units = encoder.submit(unit_frame(SLICE), 21_000).unwrap();
        units.extend(poll_until_output(&mut encoder));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].timestamp_us, 21_000);
    }

    #[cfg(unix)]
    #[test]
    fn new_input_size_restarts_the_encoder() {
        let program = stand_in("sink", "exec cat > /dev/null");
        let mut encoder = spawn_stand_in(program, 4, 1);
        assert!(encoder.submit(unit_frame(IDR), 0).is_ok());

        let mut bigger = unit_frame(SLICE);
        bigger.width = 2;
        bigger.height = 2;
        bigger.stride = 8;
        assert!(encoder.submit(bigger.clone(), 10).is_ok());
        assert_eq!((encoder.settings().width, encoder.settings().height), (2, 2));
        assert!(encoder.submit(bigger, 20).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn malformed_frame_is_an_encode_error() {
        let program = stand_in("short", "exec cat > /dev/null");
        let mut encoder = spawn_stand_in(program, 4, 1);

        let mut short = unit_frame(IDR);
        short.data.truncate(10);
        assert!(matches!(
            encoder.submit(short, 0),
            Err(PipelineError::Encode(_))
        ));

        let mut narrow = unit_frame(IDR);
        narrow.stride = 8;
        assert!(matches!(
            encoder.submit(narrow, 0),
            Err(PipelineError::Encode(_))
        ));
    }
}
