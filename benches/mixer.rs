use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use audiomux::audio::buffer::{Direction, RingBuffer};
use audiomux::audio::mixer::{AudioMixer, MixSource};
use audiomux::constants::UNITY_GAIN;

const FRAMES: u32 = 1024;

fn sources(count: usize, rate: u32) -> Vec<MixSource> {
    (0..count)
        .map(|name| MixSource {
            name,
            ring: Arc::new(RingBuffer::new(Direction::Playback, FRAMES, rate, 2, None).unwrap()),
            volume: [UNITY_GAIN / 2, UNITY_GAIN / 2],
            ramp: false,
        })
        .collect()
}

fn refill(sources: &[MixSource], samples: &[i16]) {
    for source in sources {
        source.ring.reset();
        source.ring.write(samples, Duration::ZERO).unwrap();
    }
}

fn bench_mix(c: &mut Criterion) {
    let samples: Vec<i16> = (0..FRAMES as i32 * 2).map(|i| ((i * 97) % 8000 - 4000) as i16).collect();
    let mut group = c.benchmark_group("mix");

    for tracks in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("native", tracks), &tracks, |b, &n| {
            let mut mixer = AudioMixer::new(FRAMES as usize, 44100);
            let sources = sources(n, 44100);
            let mut out = vec![0i16; FRAMES as usize * 2];
            b.iter(|| {
                refill(&sources, &samples);
                mixer.mix(black_box(&sources), &mut out);
            });
        });

        group.bench_with_input(BenchmarkId::new("resampled", tracks), &tracks, |b, &n| {
            let mut mixer = AudioMixer::new(FRAMES as usize, 44100);
            let sources = sources(n, 22050);
            let mut out = vec![0i16; FRAMES as usize * 2];
            b.iter(|| {
                refill(&sources, &samples);
                mixer.mix(black_box(&sources), &mut out);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mix);
criterion_main!(benches);
