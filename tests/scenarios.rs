//! End-to-end scenarios over the in-memory hardware

use std::time::{Duration, Instant};

use audiomux::audio::buffer::flags;
use audiomux::audio::memory::{waveform, MemoryHardware, MemoryProbe};
use audiomux::config::ServerConfig;
use audiomux::protocol::{
    AudioFormat, IoConfigEvent, IoConfigNotification, OutputFlags, StreamConfig, StreamType,
};
use audiomux::threads::OutputKind;
use audiomux::tracks::TrackState;
use audiomux::{AudioServer, Error};

const PID: u32 = 100;

fn fast_config() -> ServerConfig {
    ServerConfig {
        underrun_backoff_base_us: 100,
        underrun_backoff_max_us: 500,
        max_track_retries: 5,
        max_track_startup_retries: 5,
        ..ServerConfig::default()
    }
}

fn server_with(hw: MemoryHardware, config: ServerConfig) -> (AudioServer, MemoryProbe) {
    let probe = hw.probe();
    let server = AudioServer::new(Box::new(hw), config).unwrap();
    (server, probe)
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn stereo_waveform(frames: u64) -> Vec<i16> {
    (0..frames)
        .flat_map(|f| [waveform(f, 0), waveform(f, 1)])
        .collect()
}

#[test]
fn test_mixer_writes_waveform_in_two_cycles() {
    let (server, probe) = server_with(MemoryHardware::new(1024), ServerConfig::default());
    let out = server
        .open_output(StreamConfig::new(44100, AudioFormat::Pcm16, 2), OutputFlags::NONE)
        .unwrap();
    assert_eq!(server.frame_count(out).unwrap(), 1024);

    let track = server
        .create_track(PID, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 2048, None, out)
        .unwrap();
    assert_eq!(track.ring().frame_count(), 2048);
    assert_eq!(track.ring().frames_ready(), 0);

    let samples = stereo_waveform(2048);
    assert_eq!(track.write(&samples, Duration::ZERO).unwrap(), 2048);
    track.start().unwrap();

    let hw_out = probe.outputs()[0].clone();
    assert!(wait_until(|| hw_out.written_len() >= 2048 * 4));
    assert_eq!(&hw_out.written_samples()[..2048 * 2], &samples[..]);
    assert!(hw_out.write_count() >= 2);
}

#[test]
fn test_duplicated_output_reaches_both_sinks() {
    let hw = MemoryHardware::new(256).with_pacing();
    let (server, probe) = server_with(hw, ServerConfig::default());
    let a = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
    let b = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
    let dup = server.open_duplicate_output(a, b).unwrap();
    assert_eq!(server.sample_rate(dup).unwrap(), 44100);

    let frames = 4096u64;
    let samples = stereo_waveform(frames);
    let track = server
        .create_track(PID, StreamType::Music, 44100, AudioFormat::Pcm16, 2, frames as u32, None, dup)
        .unwrap();
    track.write(&samples, Duration::ZERO).unwrap();
    track.start().unwrap();

    // Each sink buffers three mix periods and is primed with two of silence
    // ahead of the first mixed period
    let preroll = 2 * 256usize;
    let mut expected = vec![0i16; preroll * 2];
    expected.extend_from_slice(&samples);

    let outputs = probe.outputs();
    let (out_a, out_b) = (outputs[0].clone(), outputs[1].clone());
    let bytes = expected.len() * 2;
    assert!(wait_until(|| out_a.written_len() >= bytes && out_b.written_len() >= bytes));
    let (written_a, written_b) = (out_a.written_samples(), out_b.written_samples());
    assert_eq!(&written_a[..expected.len()], &expected[..]);
    assert_eq!(&written_b[..expected.len()], &written_a[..expected.len()]);
}

#[test]
fn test_direct_output_copies_and_zero_fills() {
    let (server, probe) = server_with(MemoryHardware::new(512), ServerConfig::default());
    let mono = StreamConfig::new(44100, AudioFormat::Pcm16, 1);
    let out = server.open_output(mono, OutputFlags::NONE).unwrap();
    assert_eq!(server.output(out).unwrap().kind(), OutputKind::Direct);
    assert!(server
        .create_track(PID, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 0, None, out)
        .is_err());

    let track = server
        .create_track(PID, StreamType::Music, 44100, AudioFormat::Pcm16, 1, 0, None, out)
        .unwrap();
    let samples: Vec<i16> = (0..400).map(|f| waveform(f, 0)).collect();
    assert_eq!(track.write(&samples, Duration::ZERO).unwrap(), 400);
    track.force_ready();
    track.start().unwrap();

    let hw_out = probe.outputs()[0].clone();
    assert!(wait_until(|| hw_out.written_len() >= 512 * 2));
    let written = hw_out.written_samples();
    assert_eq!(&written[..400], &samples[..]);
    assert!(written[400..512].iter().all(|s| *s == 0));
    let (left, right) = hw_out.volume();
    assert!((left - 1.0).abs() < 1e-6 && (right - 1.0).abs() < 1e-6);
}

#[test]
fn test_capture_downsamples_and_folds() {
    let hw = MemoryHardware::new(1024)
        .with_input_frame_count(1024)
        .with_fixed_input(StreamConfig::new(44100, AudioFormat::Pcm16, 2));
    let (server, _probe) = server_with(hw, ServerConfig::default());
    let input = server
        .open_input(StreamConfig::new(22050, AudioFormat::Pcm16, 1))
        .unwrap();
    let thread = server.input(input).unwrap();
    assert_eq!(thread.native_config().sample_rate, 44100);
    assert_eq!(thread.requested_config().channels, 1);

    let record = server
        .open_record(PID, input, 22050, AudioFormat::Pcm16, 1, 4096)
        .unwrap();
    record.start().unwrap();

    let mut got = vec![0i16; 512];
    let mut filled = 0;
    assert!(wait_until(|| {
        if let Ok(n) = record.read(&mut got[filled..], Duration::from_millis(20)) {
            filled += n;
        }
        filled == got.len()
    }));
    record.stop().unwrap();

    for (k, s) in got.iter().enumerate() {
        let f = 2 * k as u64;
        let expected = (waveform(f, 0) as i32 + waveform(f, 1) as i32) >> 1;
        assert_eq!(*s as i32, expected, "frame {k}");
    }
}

#[test]
fn test_capture_rejects_unconvertible_hardware() {
    let hw = MemoryHardware::new(256).with_fixed_input(StreamConfig::new(48000, AudioFormat::Pcm16, 2));
    let (server, _probe) = server_with(hw, ServerConfig::default());
    assert!(server
        .open_input(StreamConfig::new(16000, AudioFormat::Pcm16, 1))
        .is_err());
}

#[test]
fn test_starved_track_is_evicted_and_restarts_on_write() {
    let (server, probe) = server_with(MemoryHardware::new(256), fast_config());
    let out = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
    let thread = server.output(out).unwrap();
    let track = server
        .create_track(PID, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 512, None, out)
        .unwrap();
    track.start().unwrap();
    assert!(thread.is_track_active(track.id()));

    assert!(wait_until(|| !thread.is_track_active(track.id())));
    assert!(track.ring().control().has_flag(flags::DISABLED));

    let samples = stereo_waveform(512);
    track.write(&samples, Duration::ZERO).unwrap();
    let hw_out = probe.outputs()[0].clone();
    assert!(wait_until(|| hw_out.written_len() >= 512 * 4));
    assert_eq!(&hw_out.written_samples()[..1024], &samples[..]);
}

#[test]
fn test_sample_rate_change_only_without_tracks() {
    let (server, _probe) = server_with(MemoryHardware::new(256), ServerConfig::default());
    let out = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
    let (tx, rx) = crossbeam_channel::unbounded::<IoConfigNotification>();
    server.register_client(Box::new(tx));

    server
        .set_parameters(PID, Some(out), "sampling_rate=48000")
        .unwrap();
    assert_eq!(server.sample_rate(out).unwrap(), 48000);
    let changed = rx
        .iter()
        .find(|n| n.event == IoConfigEvent::OutputConfigChanged)
        .unwrap();
    assert_eq!(changed.handle, out);
    assert_eq!(changed.descriptor.unwrap().sample_rate, 48000);

    let _track = server
        .create_track(PID, StreamType::Music, 48000, AudioFormat::Pcm16, 2, 0, None, out)
        .unwrap();
    assert!(matches!(
        server.set_parameters(PID, Some(out), "sampling_rate=44100"),
        Err(Error::InvalidOperation(_))
    ));
    assert_eq!(server.sample_rate(out).unwrap(), 48000);
}

#[test]
fn test_stop_and_pause_noops_on_stopped_track() {
    let (server, _probe) = server_with(MemoryHardware::new(256), fast_config());
    let out = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
    let track = server
        .create_track(PID, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 512, None, out)
        .unwrap();
    track.start().unwrap();
    track.stop().unwrap();
    assert_eq!(track.state(), Some(TrackState::Stopped));
    track.stop().unwrap();
    track.pause().unwrap();
    assert_eq!(track.state(), Some(TrackState::Stopped));
}

#[test]
fn test_listeners_see_open_and_close() {
    let (server, _probe) = server_with(MemoryHardware::new(256), ServerConfig::default());
    let (tx, rx) = crossbeam_channel::unbounded::<IoConfigNotification>();
    server.register_client(Box::new(tx));

    let out = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
    let opened = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(opened.event, IoConfigEvent::OutputOpened);
    assert_eq!(opened.handle, out);
    assert_eq!(opened.descriptor.unwrap().sample_rate, 44100);

    // a late listener gets the open outputs announced again
    let (late_tx, late_rx) = crossbeam_channel::unbounded::<IoConfigNotification>();
    server.register_client(Box::new(late_tx));
    let replay = late_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(replay.event, IoConfigEvent::OutputOpened);
    assert_eq!(replay.handle, out);

    server.close_output(out).unwrap();
    let closed = rx
        .iter()
        .find(|n| n.event == IoConfigEvent::OutputClosed)
        .unwrap();
    assert_eq!(closed.handle, out);
    assert!(closed.descriptor.is_none());
}

#[test]
fn test_dead_listener_is_pruned() {
    let (server, _probe) = server_with(MemoryHardware::new(256), ServerConfig::default());
    let (tx, rx) = crossbeam_channel::unbounded::<IoConfigNotification>();
    server.register_client(Box::new(tx));
    drop(rx);
    let out = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
    assert!(wait_until(|| server.dump(0).unwrap().listeners == 0));
    server.close_output(out).unwrap();
}

#[test]
fn test_static_track_loops() {
    let (server, probe) = server_with(MemoryHardware::new(64), fast_config());
    let out = server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
    let data = stereo_waveform(64);
    let track = server
        .create_track(PID, StreamType::Music, 44100, AudioFormat::Pcm16, 2, 0, Some(&data), out)
        .unwrap();
    track.set_loop(0, 64, 2).unwrap();
    track.start().unwrap();

    let hw_out = probe.outputs()[0].clone();
    assert!(wait_until(|| hw_out.written_len() >= 3 * 64 * 4));
    let written = hw_out.written_samples();
    for pass in 0..3 {
        assert_eq!(&written[pass * 128..(pass + 1) * 128], &data[..], "pass {pass}");
    }
}

#[test]
fn test_shutdown_is_idempotent() {
    let (server, _probe) = server_with(MemoryHardware::new(256), ServerConfig::default());
    server.open_output(StreamConfig::default(), OutputFlags::NONE).unwrap();
    server
        .open_input(StreamConfig::new(44100, AudioFormat::Pcm16, 2))
        .unwrap();
    server.shutdown();
    assert!(server.output_handles().is_empty());
    server.shutdown();
    assert!(server.input_handles().is_empty());
}
