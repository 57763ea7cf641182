use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    CachingCons, CachingProd, HeapRb,
    traits::{Consumer, Producer, Split},
};
use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::sync::Arc;

use crate::race::SoundCue;

const DEFAULT_SAMPLE_RATE: u32 = 44_100;
const DEFAULT_LATENCY_MS: f32 = 40.0;
const EFFECT_VOLUME: f32 = 0.35;
const MUSIC_VOLUME: f32 = 0.08;
/// Bass line looped while the race runs, in Hz.
const MUSIC_NOTES: [f32; 8] = [110.0, 110.0, 146.83, 164.81, 130.81, 130.81, 146.83, 98.0];
const MUSIC_NOTE_SECS: f32 = 0.25;

pub struct AudioOutput {
    stream: cpal::Stream,
    sample_rate: u32,
    channels: u16,
    producer: CachingProd<Arc<HeapRb<f32>>>,
}

impl AudioOutput {
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("no audio output device available")?;
        let config_range = device
            .supported_output_configs()
            .context("failed to query audio output configs")?;
        let supported_range = config_range
            .into_iter()
            .find(|cfg| cfg.sample_format() == cpal::SampleFormat::F32)
            .context("no supported f32 output config found")?;
        let desired_rate: cpal::SampleRate = DEFAULT_SAMPLE_RATE;
        let clamped_rate: cpal::SampleRate = desired_rate.clamp(
            supported_range.min_sample_rate(),
            supported_range.max_sample_rate(),
        );
        let supported_config = supported_range.with_sample_rate(clamped_rate);
        let stream_config: cpal::StreamConfig = supported_config.into();

        let channels = stream_config.channels;
        let sample_rate = stream_config.sample_rate;
        let latency_frames =
            ((DEFAULT_LATENCY_MS / 1000.0) * sample_rate as f32 * channels as f32).ceil() as usize;
        let rb_capacity = (latency_frames * 2).max(sample_rate as usize);
        let rb = Arc::new(HeapRb::<f32>::new(rb_capacity));
        let (producer, mut consumer) = rb.split();
        let err_fn = |err| tracing::warn!("audio stream error: {err:?}");
        let stream = device.build_output_stream(
            &stream_config,
            move |out: &mut [f32], _| {
                Self::fill_output(out, &mut consumer);
            },
            err_fn,
            None,
        )?;

        stream.play()?;

        Ok(Self {
            stream,
            sample_rate,
            channels,
            producer,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Push mono samples, duplicated across channels. Drops what doesn't fit.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let channels = self.channels as usize;
        for &sample in samples {
            for _ in 0..channels {
                if self.producer.try_push(sample).is_err() {
                    return;
                }
            }
        }
    }

    fn fill_output(out: &mut [f32], consumer: &mut CachingCons<Arc<HeapRb<f32>>>) {
        let filled = consumer.pop_slice(out);
        if filled < out.len() {
            out[filled..].fill(0.0);
        }
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        let _ = self.stream.pause();
    }
}

// =============================================================================
// Cue Synthesis
// =============================================================================

/// Sine sweep from `from` to `to` Hz with a linear fade-out.
fn sweep(from: f32, to: f32, secs: f32, sample_rate: u32) -> Vec<f32> {
    let n = (secs * sample_rate as f32) as usize;
    let mut phase = 0.0f32;
    (0..n)
        .map(|i| {
            let t = i as f32 / n.max(1) as f32;
            let freq = from + (to - from) * t;
            phase = (phase + TAU * freq / sample_rate as f32) % TAU;
            phase.sin() * (1.0 - t) * EFFECT_VOLUME
        })
        .collect()
}

fn cue_samples(cue: SoundCue, sample_rate: u32) -> Vec<f32> {
    match cue {
        SoundCue::CountdownBeep => sweep(440.0, 440.0, 0.15, sample_rate),
        SoundCue::Go => sweep(880.0, 880.0, 0.35, sample_rate),
        SoundCue::Crash => sweep(220.0, 40.0, 0.5, sample_rate),
        SoundCue::ObstacleBump => sweep(160.0, 90.0, 0.1, sample_rate),
        SoundCue::Win => [523.25, 659.25, 783.99, 1046.5]
            .into_iter()
            .flat_map(|f| sweep(f, f, 0.12, sample_rate))
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Music {
    Stopped,
    Playing,
    Paused,
}

/// Turns race cues into sound: one-shot effects mixed over a looping bass line.
pub struct CuePlayer {
    output: AudioOutput,
    effects: VecDeque<f32>,
    music: Music,
    music_pos: u64,
    samples_per_frame: usize,
}

impl CuePlayer {
    pub fn new(output: AudioOutput, fps: u32) -> Self {
        let samples_per_frame = (output.sample_rate() / fps.max(1)) as usize;
        Self {
            output,
            effects: VecDeque::new(),
            music: Music::Stopped,
            music_pos: 0,
            samples_per_frame,
        }
    }

    pub fn play(&mut self, cue: SoundCue) {
        match cue {
            SoundCue::MusicStart => {
                self.music = Music::Playing;
                self.music_pos = 0;
            }
            SoundCue::MusicPause if self.music == Music::Playing => self.music = Music::Paused,
            SoundCue::MusicResume if self.music == Music::Paused => self.music = Music::Playing,
            SoundCue::MusicStop => self.music = Music::Stopped,
            SoundCue::StopEffects => self.effects.clear(),
            SoundCue::MusicPause | SoundCue::MusicResume => {}
            effect => {
                let samples = cue_samples(effect, self.output.sample_rate());
                self.effects.extend(samples);
            }
        }
    }

    /// Mix and queue one frame of audio.
    pub fn frame(&mut self) {
        let rate = self.output.sample_rate() as f32;
        let note_len = (MUSIC_NOTE_SECS * rate) as u64;
        let mut buf = Vec::with_capacity(self.samples_per_frame);
        for _ in 0..self.samples_per_frame {
            let mut s = self.effects.pop_front().unwrap_or(0.0);
            if self.music == Music::Playing {
                let index = (self.music_pos / note_len.max(1)) as usize % MUSIC_NOTES.len();
                let note = MUSIC_NOTES[index];
                let t = self.music_pos as f32 / rate;
                // Square wave.
                s += if (TAU * note * t).sin() >= 0.0 { MUSIC_VOLUME } else { -MUSIC_VOLUME };
                self.music_pos += 1;
            }
            buf.push(s.clamp(-1.0, 1.0));
        }
        self.output.push_samples(&buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effects_have_expected_length_and_fade_out() {
        let beep = cue_samples(SoundCue::CountdownBeep, 10_000);
        assert_eq!(beep.len(), 1_500);
        assert!(beep.iter().all(|s| s.abs() <= EFFECT_VOLUME));
        let tail = &beep[1_450..];
        assert!(tail.iter().all(|s| s.abs() < 0.02));
        assert_eq!(cue_samples(SoundCue::Win, 10_000).len(), 4 * 1_200);
        assert!(cue_samples(SoundCue::MusicStart, 10_000).is_empty());
    }
}
