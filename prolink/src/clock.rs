//! Local beat clock driving outgoing beat and status packets.

use std::time::Duration;

use tokio::time::Instant;

/// Snapshot of the beat clock at a point in time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BeatSnapshot {
    /// Current 1-based beat number.
    pub beat: u32,
    /// 1-based beat index within the current bar.
    pub beat_within_bar: u8,
    pub tempo_bpm: f64,
    pub beat_interval_ms: f64,
    pub bar_interval_ms: f64,
    /// When the current beat started.
    pub beat_time: Instant,
    /// When the next beat is due.
    pub next_beat_time: Instant,
}

/// Monotonic musical-time reference: an anchor (time, beat) pair plus a
/// tempo. The current beat is a pure function of (anchor, tempo, now).
pub(crate) struct BeatClock {
    beats_per_bar: u32,
    tempo_bpm: f64,
    playing: bool,
    anchor_time: Instant,
    anchor_beat: u32,
}

impl BeatClock {
    pub fn new(beats_per_bar: u32) -> BeatClock {
        BeatClock {
            beats_per_bar,
            tempo_bpm: 120.0,
            playing: false,
            anchor_time: Instant::now(),
            anchor_beat: 1,
        }
    }

    pub fn set_tempo(&mut self, bpm: f64) {
        self.tempo_bpm = if bpm > 0.0 { bpm } else { 120.0 };
    }

    pub fn set_playing(&mut self, playing: bool) {
        self.playing = playing;
    }

    /// Replace the anchor outright. A beat of 0 is coerced to 1.
    pub fn align_to_beat_number(&mut self, beat: u32, when: Instant) {
        self.anchor_time = when;
        self.anchor_beat = if beat == 0 { 1 } else { beat };
    }

    /// Advance the anchor beat just enough to land on the given
    /// beat-within-bar, leaving the tempo curve untouched.
    pub fn align_to_beat_within_bar(&mut self, beat_within_bar: u8, when: Instant) {
        if self.beats_per_bar == 0 {
            return;
        }
        let current = self.beat_within_bar(self.anchor_beat);
        let mut diff = beat_within_bar as i32 - current as i32;
        if diff < 0 {
            diff += self.beats_per_bar as i32;
        }
        self.anchor_beat = self.anchor_beat.saturating_add(diff as u32);
        self.anchor_time = when;
    }

    pub fn snapshot(&self, now: Instant) -> BeatSnapshot {
        let tempo_bpm = self.tempo_bpm;
        let beat_interval_ms = 60_000.0 / tempo_bpm;
        let bar_interval_ms = beat_interval_ms * self.beats_per_bar as f64;
        let beat_duration = Duration::from_secs_f64(beat_interval_ms / 1000.0);

        if !self.playing {
            return BeatSnapshot {
                beat: self.anchor_beat,
                beat_within_bar: self.beat_within_bar(self.anchor_beat),
                tempo_bpm,
                beat_interval_ms,
                bar_interval_ms,
                beat_time: now,
                next_beat_time: now + beat_duration,
            };
        }

        let elapsed_ms = now.saturating_duration_since(self.anchor_time).as_secs_f64() * 1000.0;
        let beat_delta = (elapsed_ms / beat_interval_ms).floor() as u32;
        let beat = self.anchor_beat.saturating_add(beat_delta);
        let beat_time = self.anchor_time + beat_duration * beat_delta;
        BeatSnapshot {
            beat,
            beat_within_bar: self.beat_within_bar(beat),
            tempo_bpm,
            beat_interval_ms,
            bar_interval_ms,
            beat_time,
            next_beat_time: beat_time + beat_duration,
        }
    }

    fn beat_within_bar(&self, beat: u32) -> u8 {
        if self.beats_per_bar == 0 {
            return 1;
        }
        ((beat.saturating_sub(1) % self.beats_per_bar) + 1) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calculates_correct_intervals() {
        let mut clock = BeatClock::new(4);
        clock.set_tempo(120.0);

        let snapshot = clock.snapshot(Instant::now());
        assert!((snapshot.beat_interval_ms - 500.0).abs() < 0.5);
        assert!((snapshot.bar_interval_ms - 2000.0).abs() < 1.0);
    }

    #[test]
    fn alignment_to_beat_zero_becomes_one() {
        let mut clock = BeatClock::new(4);
        let now = Instant::now();
        clock.align_to_beat_number(0, now);

        let snapshot = clock.snapshot(now);
        assert_eq!(snapshot.beat, 1);
        assert_eq!(snapshot.beat_within_bar, 1);
    }

    #[test]
    fn playing_advances_beat() {
        let mut clock = BeatClock::new(4);
        clock.set_tempo(120.0);
        clock.set_playing(true);

        let start = Instant::now();
        clock.align_to_beat_number(1, start);

        let snapshot = clock.snapshot(start + Duration::from_millis(500));
        assert_eq!(snapshot.beat, 2);
        assert_eq!(snapshot.beat_within_bar, 2);
    }

    #[test]
    fn snapshot_is_a_pure_function_of_now() {
        let mut clock = BeatClock::new(4);
        clock.set_tempo(120.0);
        clock.set_playing(true);
        let start = Instant::now();
        clock.align_to_beat_number(1, start);

        let later = start + Duration::from_millis(1250);
        let first = clock.snapshot(later);
        let second = clock.snapshot(later);
        assert_eq!(first.beat, second.beat);
        assert_eq!(first.beat_time, second.beat_time);
        assert_eq!(first.beat, 3);
    }

    #[test]
    fn align_to_beat_within_bar_wraps() {
        let mut clock = BeatClock::new(4);
        let now = Instant::now();
        clock.align_to_beat_number(1, now);
        clock.align_to_beat_within_bar(4, now);

        let snapshot = clock.snapshot(now);
        assert_eq!(snapshot.beat_within_bar, 4);
    }

    #[test]
    fn tempo_zero_defaults_to_120() {
        let mut clock = BeatClock::new(4);
        clock.set_tempo(0.0);

        let snapshot = clock.snapshot(Instant::now());
        assert!((snapshot.tempo_bpm - 120.0).abs() < 0.1);
    }

    #[test]
    fn stopped_clock_holds_its_beat() {
        let mut clock = BeatClock::new(4);
        clock.set_tempo(120.0);
        let start = Instant::now();
        clock.align_to_beat_number(7, start);

        let snapshot = clock.snapshot(start + Duration::from_secs(10));
        assert_eq!(snapshot.beat, 7);
        assert_eq!(snapshot.beat_within_bar, 3);
    }
}
