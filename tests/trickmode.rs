// Tests for keyframe-only trick mode: target-time stepping and sync-sample
// selection.

pub mod common;

use std::time::Duration;
use pretty_assertions::assert_eq;
use adaptive_stream::scheduler::{compute_trickmode_target, select_sync_sample};
use adaptive_stream::isobmff::SyncSample;
use adaptive_stream::{Direction, Segment};
use common::{setup_logging, url};

fn fragment_at(pts_secs: u64, duration_secs: u64) -> Segment {
    Segment {
        sequence: pts_secs as i64 / duration_secs.max(1) as i64,
        uri: url("http://h/frag.mp4"),
        range: None,
        pts: Duration::from_secs(pts_secs),
        duration: Duration::from_secs(duration_secs),
        discont: false,
        key: None,
        date_time: None,
        title: None,
    }
}

/// Twenty sync samples evenly spread over a 4-second fragment, 90 kHz.
fn twenty_samples(fragment_pts_secs: u64) -> Vec<SyncSample> {
    let timescale = 90_000u64;
    let step = 4 * timescale / 20;
    (0..20)
        .map(|i| SyncSample {
            start_offset: 10_000 + 2_000 * i as u64,
            end_offset: 10_000 + 2_000 * (i + 1) as u64,
            ts: Some(fragment_pts_secs * timescale + i as u64 * step),
            duration: step as u32,
        })
        .collect()
}

// Scenario: rate 8, avg_dl = 200ms, buffer level 100ms. The scheduler must
// target now + 600ms in running time, i.e. a 4-second presentation skip.
#[test]
fn low_buffer_forces_aggressive_skip() {
    setup_logging();
    let mut skip_ema = Duration::ZERO;
    let now_rt = Duration::from_secs(30);
    let cur_rt = now_rt + Duration::from_millis(100);
    let target = compute_trickmode_target(
        now_rt,
        cur_rt,
        Duration::from_secs(8),  // current presentation position
        Duration::from_millis(75),
        Duration::from_millis(200),
        8.0,
        0.0,
        0,
        6_000,
        Duration::from_millis(200),
        &mut skip_ema,
    );
    // Running-time step: (now + 3*200ms) - cur = 500ms; at rate 8 that is a
    // 4s presentation step.
    assert_eq!(target, Duration::from_secs(12));
}

#[test]
fn comfortable_buffer_steps_by_download_time() {
    let mut skip_ema = Duration::ZERO;
    let now_rt = Duration::from_secs(30);
    let cur_rt = now_rt + Duration::from_secs(10);
    let target = compute_trickmode_target(
        now_rt,
        cur_rt,
        Duration::from_secs(8),
        Duration::from_millis(1),
        Duration::from_millis(200),
        1.0,
        0.0,
        0,
        0,
        Duration::ZERO,
        &mut skip_ema,
    );
    assert_eq!(target, Duration::from_secs(8) + Duration::from_millis(200));
}

#[test]
fn bitrate_cap_widens_the_step() {
    let mut skip_ema = Duration::ZERO;
    let now_rt = Duration::from_secs(30);
    let cur_rt = now_rt + Duration::from_secs(10);
    // 100 KiB keyframes every second at rate 1 is ~819 kbit/s; capping at
    // 200 kbit/s must widen the step to ~4.1s.
    let target = compute_trickmode_target(
        now_rt,
        cur_rt,
        Duration::ZERO,
        Duration::from_millis(1),
        Duration::from_millis(100),
        1.0,
        0.0,
        200_000,
        102_400,
        Duration::from_secs(1),
        &mut skip_ema,
    );
    let step = target;
    assert!(
        step > Duration::from_secs(4) && step < Duration::from_secs(5),
        "step was {step:?}"
    );
}

// Property: in forward trick mode the emitted keyframe timestamps are
// strictly increasing; in reverse, strictly decreasing.
#[test]
fn emitted_keyframes_are_monotonic() {
    let timescale = 90_000u64;
    let mut skip_ema = Duration::ZERO;
    let mut position = Duration::ZERO;
    let mut emitted = Vec::new();
    let mut cur_rt = Duration::ZERO;
    // Simulate 30 rounds of compute-target, advance to the fragment holding
    // the target, select the nearest sync sample.
    for _ in 0..30 {
        let now_rt = cur_rt; // downstream right behind us: aggressive mode
        let target = compute_trickmode_target(
            now_rt,
            cur_rt,
            position,
            Duration::from_millis(75),
            Duration::from_millis(200),
            8.0,
            0.0,
            0,
            2_000,
            Duration::from_millis(200),
            &mut skip_ema,
        );
        let frag_start = (target.as_secs() / 4) * 4;
        let fragment = fragment_at(frag_start, 4);
        let samples = twenty_samples(frag_start);
        let Some(sample) =
            select_sync_sample(&samples, timescale, &fragment, target, Direction::Forward)
        else {
            break;
        };
        let pts = Duration::from_nanos(
            sample.ts.unwrap() as u64 * 1_000_000_000 / timescale,
        );
        emitted.push(pts);
        position = pts;
        cur_rt += Duration::from_millis(250);
    }
    assert!(emitted.len() >= 10);
    for pair in emitted.windows(2) {
        assert!(pair[1] > pair[0], "keyframe timestamps must increase: {emitted:?}");
    }
    // Scenario D: at rate 8 the average presentation stride stays at or
    // above 600ms / 8 = 75ms.
    let total = *emitted.last().unwrap() - emitted[0];
    let avg = total / (emitted.len() as u32 - 1);
    assert!(avg >= Duration::from_millis(75), "average stride {avg:?}");
}

#[test]
fn reverse_selection_is_monotonic_decreasing() {
    let timescale = 90_000u64;
    let samples = twenty_samples(0);
    let fragment = fragment_at(0, 4);
    let mut target = Duration::from_secs(4);
    let mut emitted = Vec::new();
    loop {
        let Some(sample) =
            select_sync_sample(&samples, timescale, &fragment, target, Direction::Reverse)
        else {
            break;
        };
        let pts = Duration::from_nanos(
            sample.ts.unwrap() as u64 * 1_000_000_000 / timescale,
        );
        if emitted.last() == Some(&pts) {
            break;
        }
        emitted.push(pts);
        let Some(next) = pts.checked_sub(Duration::from_millis(300)) else {
            break;
        };
        target = next;
    }
    assert!(emitted.len() > 3);
    for pair in emitted.windows(2) {
        assert!(pair[1] < pair[0], "reverse keyframes must decrease: {emitted:?}");
    }
}

#[test]
fn selection_clamps_at_fragment_edges() {
    let timescale = 90_000u64;
    let samples = twenty_samples(0);
    let fragment = fragment_at(0, 4);
    // Past the final sample: the last one is returned.
    let sample = select_sync_sample(
        &samples,
        timescale,
        &fragment,
        Duration::from_secs(100),
        Direction::Forward,
    )
    .unwrap();
    assert_eq!(sample.ts, samples.last().unwrap().ts);
    // Before the first sample in reverse: the first one is returned.
    let sample = select_sync_sample(
        &samples,
        timescale,
        &fragment,
        Duration::ZERO,
        Direction::Reverse,
    )
    .unwrap();
    assert_eq!(sample.ts, samples.first().unwrap().ts);
}
