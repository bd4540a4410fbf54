use criterion::{black_box, criterion_group, criterion_main, Criterion};
use whisperrr_service::audio::Waveform;
use whisperrr_service::media::sniffer::{classify_format_name, match_signature};
use whisperrr_service::progress::StageRange;

fn bench_sniffing(c: &mut Criterion) {
    let headers: [(&[u8], Option<&str>); 5] = [
        (&b"RIFF\x24\0\0\0WAVEfmt "[..], Some("wav")),
        (&b"ID3\x04\0\0\0\0\0\0"[..], Some("mp3")),
        (&b"\0\0\0\x20ftypisom\0\0\x02\0"[..], Some("mov")),
        (&[0x1A, 0x45, 0xDF, 0xA3, 0x9F, 0x42, 0x82, 0x88][..], Some("webm")),
        (&b"not a media file at all"[..], Some("txt")),
    ];

    c.bench_function("match_signature", |b| {
        b.iter(|| {
            for (header, ext) in &headers {
                black_box(match_signature(black_box(header), *ext));
            }
        })
    });

    c.bench_function("classify_format_name", |b| {
        b.iter(|| {
            black_box(classify_format_name("mov,mp4,m4a,3gp,3g2,mj2", Some("m4a")));
            black_box(classify_format_name("matroska,webm", None));
            black_box(classify_format_name("asf", Some("wmv")));
        })
    });
}

fn bench_stage_ranges(c: &mut Criterion) {
    let pipeline = StageRange::new(0.0, 40.0);
    let convert = pipeline.within(StageRange::new(25.0, 75.0));

    c.bench_function("stage_range_map", |b| {
        b.iter(|| {
            for local in 0..=100 {
                black_box(convert.map(black_box(local as f64)));
            }
        })
    });
}

fn bench_normalize(c: &mut Criterion) {
    // one minute of canonical audio
    let samples: Vec<f32> = (0..16000 * 60).map(|i| 0.2 * (i as f32 * 0.01).sin()).collect();

    c.bench_function("peak_normalize_60s", |b| {
        b.iter(|| {
            let mut waveform = Waveform {
                samples: samples.clone(),
                sample_rate: 16000,
                channels: 1,
            };
            waveform.peak_normalize();
            black_box(waveform)
        })
    });
}

criterion_group!(benches, bench_sniffing, bench_stage_ranges, bench_normalize);
criterion_main!(benches);
