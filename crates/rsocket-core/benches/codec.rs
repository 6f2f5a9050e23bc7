use bytes::{Bytes, BytesMut};
use criterion::{Criterion, black_box};
use rsocket_core::{DecodeOutcome, Frame, FrameCodec, Payload};
use std::{env, time::Duration};

/// 编解码基准：批量编码 64 个 PAYLOAD 帧后再逐帧解码。
///
/// # 设计背景（Why）
/// - 写任务按批次聚合出站帧，读循环按长度前缀逐帧切分；该基准覆盖这两条热路径。
///
/// # 逻辑解析（How）
/// - 每帧携带 1 KiB 数据与 32 字节元数据，编码进同一个 `BytesMut`，随后循环 `decode` 直到 `Incomplete`。
fn bench_payload_batch(c: &mut Criterion) {
    let codec = FrameCodec::default();
    let payload = Payload::new(
        Some(Bytes::from(vec![7u8; 1024])),
        Some(Bytes::from(vec![1u8; 32])),
    );
    c.bench_function("payload_batch_roundtrip", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(64 * 1100);
            for stream_id in 1..=64u32 {
                codec
                    .encode(&Frame::next(stream_id * 2 - 1, payload.clone(), false), &mut buf)
                    .unwrap();
            }
            let mut frames = 0usize;
            while let DecodeOutcome::Complete(frame) = codec.decode(&mut buf).unwrap() {
                frames += black_box(frame).stream_id() as usize & 1;
            }
            black_box(frames)
        });
    });
}

/// 控制帧基准：REQUEST_N 与 CANCEL 没有载荷，反映帧头处理的固定成本。
fn bench_control_frames(c: &mut Criterion) {
    let codec = FrameCodec::default();
    c.bench_function("control_frame_roundtrip", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(256);
            codec
                .encode(&Frame::RequestN { stream_id: 3, n: 128 }, &mut buf)
                .unwrap();
            codec.encode(&Frame::Cancel { stream_id: 3 }, &mut buf).unwrap();
            let first = codec.decode(&mut buf).unwrap();
            let second = codec.decode(&mut buf).unwrap();
            black_box((first, second))
        });
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_payload_batch(&mut criterion);
    bench_control_frames(&mut criterion);
    criterion.final_summary();
}
