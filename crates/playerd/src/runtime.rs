//! Wires the output backend into a runnable daemon: a test-tone
//! producer, a stdin command loop, and cooperative shutdown.

use std::f64::consts::PI;
use std::io::BufRead;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Sender};

use alsa_output::device::ctl_for_device;
use alsa_output::mixer::MixerSession;
use alsa_output::state::{OutputState, PlayerState};
use alsa_output::volume::{VolumeControl, VOLUME_CURVE};
use alsa_output::worker::{self, OutputHooks, WorkerOptions};

use crate::config::PlayerConfig;

/// Ring capacity in frames; roughly three quarters of a second at 44.1k.
const RING_FRAMES: usize = 32_768;
/// Frames the tone producer pushes per refill.
const TONE_CHUNK_FRAMES: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerCommand {
    Volume(u32, u32),
    SetState(PlayerState),
    Quit,
}

/// Parse one line of the stdin control protocol.
fn parse_command(line: &str, raw_volume: bool) -> Result<PlayerCommand, String> {
    let mut words = line.split_whitespace();
    match words.next() {
        Some("on") => Ok(PlayerCommand::SetState(PlayerState::Buffering)),
        Some("stop") => Ok(PlayerCommand::SetState(PlayerState::Stopped)),
        Some("off") => Ok(PlayerCommand::SetState(PlayerState::Off)),
        Some("quit") | Some("exit") => Ok(PlayerCommand::Quit),
        None => Err("empty command".to_string()),
        Some("vol") => {
            let left = words.next().ok_or("usage: vol <left> [right]")?;
            let left = volume_gain(left, raw_volume)?;
            let right = match words.next() {
                Some(r) => volume_gain(r, raw_volume)?,
                None => left,
            };
            Ok(PlayerCommand::Volume(left, right))
        }
        Some(other) => Err(format!("unknown command {other:?}")),
    }
}

/// Map a volume word to a 16.16 gain: 0..=100 through the protocol
/// curve, or verbatim in raw mode.
fn volume_gain(word: &str, raw: bool) -> Result<u32, String> {
    let n: u32 = word.parse().map_err(|_| format!("bad volume {word:?}"))?;
    if raw {
        return Ok(n);
    }
    if n > 100 {
        return Err(format!("volume {n} out of range 0..=100"));
    }
    Ok(VOLUME_CURVE[(100 - n) as usize] as u32)
}

/// Attach the hardware mixer if one is configured, falling back to
/// software volume when the attach fails or unmute-to-max is requested.
fn build_volume(config: &PlayerConfig) -> VolumeControl {
    let Some(m) = &config.mixer else {
        return VolumeControl::software(config.db_volume);
    };
    let ctl = m
        .ctl
        .clone()
        .unwrap_or_else(|| ctl_for_device(&config.device));

    match MixerSession::attach(&ctl, &m.name, m.index) {
        Ok(session) => {
            if config.unmute {
                let mut control = VolumeControl::hardware(session, config.mixer_linear);
                control.unmute_to_max();
                tracing::info!(element = %m.name, "mixer set to maximum, volume stays in software");
                VolumeControl::software(config.db_volume)
            } else {
                tracing::info!(element = %m.name, ctl = %ctl, "hardware volume enabled");
                VolumeControl::hardware(session, config.mixer_linear)
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "mixer unavailable, using software volume");
            VolumeControl::software(config.db_volume)
        }
    }
}

fn power_hooks(config: &PlayerConfig) -> OutputHooks {
    let mut hooks = OutputHooks::default();
    if let Some(script) = config.power_script.clone() {
        hooks.on_power = Some(Box::new(move |on| {
            let arg = if on { "on" } else { "off" };
            match Command::new(&script).arg(arg).status() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    tracing::warn!(script = %script.display(), %status, "power script failed")
                }
                Err(e) => {
                    tracing::warn!(script = %script.display(), error = %e, "power script error")
                }
            }
        }));
    }
    hooks
}

/// Fill the ring with a sine tone whenever playback wants audio.
fn spawn_tone_producer(
    shared: Arc<Mutex<OutputState>>,
    running: Arc<AtomicBool>,
    rate: u32,
    tone_hz: f64,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name("tone".into()).spawn(move || {
        let step = 2.0 * PI * tone_hz / f64::from(rate);
        let amplitude = 0.25 * f64::from(i32::MAX);
        let mut phase = 0.0f64;
        let mut chunk = vec![0i32; TONE_CHUNK_FRAMES * 2];

        while running.load(Ordering::Relaxed) {
            let pushed = {
                let mut out = shared.lock().unwrap();
                let wants_audio = matches!(
                    out.state,
                    PlayerState::Buffering | PlayerState::Running
                );
                if wants_audio && out.ring.frames_free() >= TONE_CHUNK_FRAMES {
                    for frame in chunk.chunks_exact_mut(2) {
                        let s = (phase.sin() * amplitude) as i32;
                        frame[0] = s;
                        frame[1] = s;
                        phase = (phase + step) % (2.0 * PI);
                    }
                    out.ring.push_frames(&chunk);
                    true
                } else {
                    false
                }
            };
            if !pushed {
                thread::sleep(Duration::from_millis(5));
            }
        }
    })
}

fn spawn_stdin_reader(tx: Sender<PlayerCommand>, raw_volume: bool) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name("stdin".into()).spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line, raw_volume) {
                Ok(PlayerCommand::Quit) => {
                    let _ = tx.send(PlayerCommand::Quit);
                    return;
                }
                Ok(cmd) => {
                    if tx.send(cmd).is_err() {
                        return;
                    }
                }
                Err(msg) => tracing::warn!(%msg, "ignored command"),
            }
        }
        let _ = tx.send(PlayerCommand::Quit);
    })
}

pub fn run(config: PlayerConfig) -> Result<()> {
    let shared = OutputState::shared(&config.device, config.buffer, config.period, RING_FRAMES);
    {
        let mut out = shared.lock().unwrap();
        out.current_sample_rate = config.rate;
        out.encoding = config.encoding;
        out.invert = config.invert;
    }

    let running = Arc::new(AtomicBool::new(true));
    let mut volume = build_volume(&config);
    volume.set_volume(&shared, 65_536, 65_536);

    let opts = WorkerOptions {
        probe_device: true,
        reopen_workaround: config.reopen,
        mmap: config.mmap,
        format_hint: config.format,
        rt_priority: config.rt_priority,
        pin_to_last_cpu: config.pin_cpu,
        hooks: power_hooks(&config),
    };
    let worker =
        worker::spawn(shared.clone(), running.clone(), opts).context("spawn output worker")?;
    let producer = spawn_tone_producer(shared.clone(), running.clone(), config.rate, config.tone_hz)
        .context("spawn tone producer")?;

    let (tx, rx) = unbounded();
    let ctrlc_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.send(PlayerCommand::Quit);
    })
    .context("install signal handler")?;
    let _stdin = spawn_stdin_reader(tx, config.raw_volume).context("spawn stdin reader")?;

    tracing::info!(device = %config.device, rate_hz = config.rate, "ready; commands: on, stop, off, vol <0-100>, quit");

    for cmd in rx.iter() {
        match cmd {
            PlayerCommand::Volume(left, right) => volume.set_volume(&shared, left, right),
            PlayerCommand::SetState(state) => {
                let mut out = shared.lock().unwrap();
                if state == PlayerState::Buffering && out.state.is_off() {
                    out.ring.clear();
                }
                tracing::info!(from = ?out.state, to = ?state, "player state");
                out.state = state;
            }
            PlayerCommand::Quit => break,
        }
    }

    tracing::info!("shutting down");
    running.store(false, Ordering::Relaxed);
    worker.shutdown();
    if producer.join().is_err() {
        tracing::error!("tone producer panicked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_commands_parse() {
        assert_eq!(
            parse_command("on", false).unwrap(),
            PlayerCommand::SetState(PlayerState::Buffering)
        );
        assert_eq!(
            parse_command("  stop ", false).unwrap(),
            PlayerCommand::SetState(PlayerState::Stopped)
        );
        assert_eq!(
            parse_command("off", false).unwrap(),
            PlayerCommand::SetState(PlayerState::Off)
        );
        assert_eq!(parse_command("quit", false).unwrap(), PlayerCommand::Quit);
    }

    #[test]
    fn volume_commands_map_through_the_curve() {
        assert_eq!(
            parse_command("vol 100", false).unwrap(),
            PlayerCommand::Volume(65_536, 65_536)
        );
        assert_eq!(
            parse_command("vol 0", false).unwrap(),
            PlayerCommand::Volume(0, 0)
        );
        // Separate left and right levels.
        assert_eq!(
            parse_command("vol 100 0", false).unwrap(),
            PlayerCommand::Volume(65_536, 0)
        );
    }

    #[test]
    fn raw_volume_skips_the_curve() {
        assert_eq!(
            parse_command("vol 12345", true).unwrap(),
            PlayerCommand::Volume(12_345, 12_345)
        );
        assert!(parse_command("vol 101", false).is_err());
    }

    #[test]
    fn junk_commands_are_rejected() {
        assert!(parse_command("vol", false).is_err());
        assert!(parse_command("vol x", false).is_err());
        assert!(parse_command("bounce", false).is_err());
    }
}
