//! The output worker thread.
//!
//! One dedicated thread owns the device session for its whole lifetime:
//! it waits while output is off, probes for the device, opens and
//! negotiates it, feeds it frames, recovers from xruns and suspends, and
//! tears the session down again. Every fault path ends in retry or
//! reopen; the thread itself never exits except on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use alsa::pcm::State;

use crate::device::{self, DeviceSession, NegotiatedParams, OpenRequest};
use crate::error::TransferError;
use crate::state::{OutputState, PlayerState};
use crate::types::{Encoding, SampleFormat};
use crate::writer;

/// Poll interval while output is off.
const OFF_POLL: Duration = Duration::from_millis(100);
/// Pause between device probes and failed open attempts.
const RETRY_DELAY: Duration = Duration::from_secs(5);
/// Short pause when the device has no room for frames.
const IDLE_SLEEP: Duration = Duration::from_millis(10);
/// Granularity of interruptible sleeps; bounds shutdown latency.
const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// Callbacks fired on session power transitions.
#[derive(Default)]
pub struct OutputHooks {
    /// Invoked with `true` before a device open, `false` after teardown.
    pub on_power: Option<Box<dyn Fn(bool) + Send>>,
    /// Invoked when playback output turns off.
    pub on_stop: Option<Box<dyn Fn() + Send>>,
}

/// Static configuration for the worker thread.
pub struct WorkerOptions {
    /// Wait for the device to appear instead of failing open attempts.
    pub probe_device: bool,
    /// Close and reopen once after a successful open; some USB DACs need
    /// a second open before they accept a new rate.
    pub reopen_workaround: bool,
    pub mmap: bool,
    pub format_hint: Option<SampleFormat>,
    /// SCHED_FIFO priority; scheduling failures degrade silently.
    pub rt_priority: Option<u32>,
    /// Pin the worker to the last online CPU.
    pub pin_to_last_cpu: bool,
    pub hooks: OutputHooks,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            probe_device: false,
            reopen_workaround: false,
            mmap: true,
            format_hint: None,
            rt_priority: None,
            pin_to_last_cpu: false,
            hooks: OutputHooks::default(),
        }
    }
}

/// Handle to a spawned worker thread.
pub struct OutputWorker {
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl OutputWorker {
    /// Request shutdown and wait for the thread to exit.
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("output worker panicked");
            }
        }
    }
}

/// Spawn the output worker.
pub fn spawn(
    shared: Arc<Mutex<OutputState>>,
    running: Arc<AtomicBool>,
    opts: WorkerOptions,
) -> std::io::Result<OutputWorker> {
    let thread_running = running.clone();
    let handle = thread::Builder::new()
        .name("output".into())
        .spawn(move || run(shared, thread_running, opts))?;
    Ok(OutputWorker {
        handle: Some(handle),
        running,
    })
}

/// What the loop does about the current device state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeviceAction {
    Continue,
    /// Hand the errno to the recovery primitive; `restart` re-arms the
    /// cold-start path afterwards.
    Recover { errno: i32, restart: bool },
    /// The device is gone; tear down and return to probing.
    Reprobe,
}

fn device_action(state: State) -> DeviceAction {
    match state {
        State::XRun => DeviceAction::Recover {
            errno: libc::EPIPE,
            restart: true,
        },
        State::Suspended => DeviceAction::Recover {
            errno: libc::ESTRPIPE,
            restart: false,
        },
        State::Disconnected => DeviceAction::Reprobe,
        _ => DeviceAction::Continue,
    }
}

/// A failed cold-start kick either reprobes (device gone after
/// recovery) or stays armed for another attempt next cycle.
fn kick_failure_action(recovery_errno: Option<i32>) -> DeviceAction {
    match recovery_errno {
        Some(libc::ENODEV) => DeviceAction::Reprobe,
        _ => DeviceAction::Continue,
    }
}

fn needs_reopen(open: Option<(u32, Encoding)>, rate: u32, encoding: Encoding) -> bool {
    open != Some((rate, encoding))
}

/// Post-open bookkeeping on the shared state: clear the failure flag,
/// reset playback telemetry, and derive the startup threshold from the
/// negotiated geometry (two full device buffers).
fn note_session_opened(out: &mut OutputState, params: &NegotiatedParams) {
    out.error_opening = false;
    out.start_frames = 2 * params.buffer_size as u64;
    out.frames_played = 0;
    out.frames_played_snapshot = 0;
    out.device_frames = 0;
    out.updated = None;
}

/// Per-iteration work bound: a whole buffer for direct access, one
/// period for buffered writes.
fn batch_clamp(params: &NegotiatedParams) -> usize {
    if params.mmap {
        params.buffer_size
    } else {
        params.period_size
    }
}

/// Sleep in short slices so shutdown is never delayed by a backoff.
fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let mut left = total;
    while !left.is_zero() && running.load(Ordering::Relaxed) {
        let step = left.min(SLEEP_SLICE);
        thread::sleep(step);
        left -= step;
    }
}

/// Best-effort realtime setup; failures are logged at startup and the
/// thread keeps running at normal priority.
fn apply_realtime(priority: Option<u32>, pin_to_last_cpu: bool) {
    if let Some(prio) = priority {
        let param = libc::sched_param {
            sched_priority: prio as i32,
        };
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if rc != 0 {
            tracing::info!(priority = prio, "unable to set realtime scheduling");
        } else {
            tracing::debug!(priority = prio, "realtime scheduling enabled");
        }
    }

    if pin_to_last_cpu {
        let cores = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if cores > 1 {
            let rc = unsafe {
                let mut set: libc::cpu_set_t = std::mem::zeroed();
                libc::CPU_ZERO(&mut set);
                libc::CPU_SET((cores - 1) as usize, &mut set);
                libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
            };
            if rc != 0 {
                tracing::info!(core = cores - 1, "unable to pin output thread");
            } else {
                tracing::debug!(core = cores - 1, "output thread pinned");
            }
        }
    }
}

struct PowerState {
    powered: bool,
}

impl PowerState {
    fn set(&mut self, hooks: &OutputHooks, on: bool) {
        if self.powered == on {
            return;
        }
        self.powered = on;
        if let Some(hook) = &hooks.on_power {
            hook(on);
        }
    }
}

fn run(shared: Arc<Mutex<OutputState>>, running: Arc<AtomicBool>, opts: WorkerOptions) {
    apply_realtime(opts.rt_priority, opts.pin_to_last_cpu);

    let mut session: Option<DeviceSession> = None;
    let mut probing = opts.probe_device;
    let mut start = true;
    let mut power = PowerState { powered: false };

    while running.load(Ordering::Relaxed) {
        let (state, device, buffer, period, rate, encoding) = {
            let out = shared.lock().unwrap();
            (
                out.state,
                out.device.clone(),
                out.buffer,
                out.period,
                out.current_sample_rate,
                out.encoding,
            )
        };

        if state.is_off() {
            if session.is_some() {
                tracing::info!(device = %device, "output off, closing device");
                session = None;
                if let Some(hook) = &opts.hooks.on_stop {
                    hook();
                }
                power.set(&opts.hooks, false);
            }
            thread::sleep(OFF_POLL);
            continue;
        }

        if probing {
            if device::probe(&device) {
                tracing::info!(device = %device, "device available");
                probing = false;
            } else {
                sleep_while_running(&running, RETRY_DELAY);
                continue;
            }
        }

        if needs_reopen(session.as_ref().map(|s| s.stream_shape()), rate, encoding) {
            session = None;
            power.set(&opts.hooks, true);

            let req = OpenRequest {
                device: &device,
                rate,
                buffer,
                period,
                encoding,
                format_hint: opts.format_hint,
                mmap: opts.mmap,
            };

            if opts.reopen_workaround {
                // First open settles the device, second one is kept.
                let _ = DeviceSession::open(&req);
            }

            match DeviceSession::open(&req) {
                Ok(s) => {
                    note_session_opened(&mut shared.lock().unwrap(), s.params());
                    session = Some(s);
                    start = true;
                }
                Err(e) => {
                    tracing::warn!(device = %device, rate_hz = rate, error = %e, "unable to open device");
                    shared.lock().unwrap().error_opening = true;
                    sleep_while_running(&running, RETRY_DELAY);
                    continue;
                }
            }
        }

        let Some(sess) = session.as_mut() else {
            continue;
        };

        match device_action(sess.pcm_state()) {
            DeviceAction::Continue => {}
            DeviceAction::Recover { errno, restart } => {
                tracing::warn!(state = ?sess.pcm_state(), "device fault, recovering");
                if let Err(e) = sess.recover(errno, true) {
                    tracing::warn!(error = %e, "recovery failed");
                    thread::sleep(IDLE_SLEEP);
                }
                if restart {
                    start = true;
                    continue;
                }
            }
            DeviceAction::Reprobe => {
                tracing::warn!(device = %device, "device disconnected");
                session = None;
                probing = true;
                start = true;
                continue;
            }
        }

        let avail = match sess.avail() {
            Ok(a) => a.max(0) as usize,
            Err(e) => {
                if e.errno() == libc::ENODEV {
                    tracing::warn!(device = %device, "device vanished");
                    session = None;
                    probing = true;
                    start = true;
                } else {
                    tracing::warn!(error = %e, "avail query failed, recovering");
                    let _ = sess.recover(e.errno(), true);
                    start = true;
                }
                continue;
            }
        };

        let params = *sess.params();
        if avail < params.period_size {
            if start {
                if params.mmap {
                    match sess.start_transfer() {
                        Ok(()) => start = false,
                        Err(e) => {
                            let recovery = sess.recover(e.errno(), true).err().map(|re| re.errno());
                            if kick_failure_action(recovery) == DeviceAction::Reprobe {
                                session = None;
                                probing = true;
                                continue;
                            }
                            // The kick stays armed; retried next cycle.
                            tracing::warn!(error = %e, "device start failed");
                        }
                    }
                } else {
                    start = false;
                }
            } else {
                thread::sleep(IDLE_SLEEP);
                match sess.wait(1000) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!("device wait timed out");
                        start = true;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "device wait failed, recovering");
                        let _ = sess.recover(e.errno(), true);
                        start = true;
                    }
                }
                continue;
            }
        }

        let batch = avail.min(batch_clamp(&params));
        if batch == 0 {
            thread::sleep(IDLE_SLEEP);
            continue;
        }

        let mut out = shared.lock().unwrap();

        if out.state == PlayerState::Off {
            drop(out);
            continue;
        }

        match sess.delay() {
            Ok(delay) => {
                out.device_frames = delay as i64;
                out.frames_played_snapshot = out.frames_played;
                out.updated = Some(Instant::now());
            }
            Err(e) if e.errno() == libc::EPIPE => {
                // Underrun; the state check next cycle recovers it.
                drop(out);
                continue;
            }
            Err(e) if e.errno() == libc::EIO => {
                drop(out);
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            Err(e) => {
                tracing::debug!(error = %e, "delay query failed");
            }
        }

        match writer::write_frames(sess, &mut out, batch) {
            Ok(0) => {
                drop(out);
                thread::sleep(IDLE_SLEEP);
            }
            Ok(_) => {}
            Err(TransferError::DeviceLost) => {
                tracing::warn!(device = %device, "giving up on device, reopening");
                drop(out);
                session = None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "transfer failed");
                drop(out);
                thread::sleep(IDLE_SLEEP);
            }
        }
    }

    if session.take().is_some() {
        if let Some(hook) = &opts.hooks.on_stop {
            hook();
        }
    }
    power.set(&opts.hooks, false);
    tracing::debug!("output worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xrun_recovers_and_rearms_cold_start() {
        assert_eq!(
            device_action(State::XRun),
            DeviceAction::Recover {
                errno: libc::EPIPE,
                restart: true
            }
        );
    }

    #[test]
    fn suspend_recovers_without_restart() {
        assert_eq!(
            device_action(State::Suspended),
            DeviceAction::Recover {
                errno: libc::ESTRPIPE,
                restart: false
            }
        );
    }

    #[test]
    fn fault_sequence_resolves_without_stopping() {
        // A scripted run of device states: every entry must map to an
        // action that keeps the loop alive.
        let script = [
            State::XRun,
            State::Running,
            State::Suspended,
            State::Running,
            State::Disconnected,
        ];
        let actions: Vec<_> = script.iter().map(|&s| device_action(s)).collect();
        assert_eq!(actions[1], DeviceAction::Continue);
        assert_eq!(actions[3], DeviceAction::Continue);
        // The disconnect ends in a reprobe, not an exit.
        assert_eq!(actions[4], DeviceAction::Reprobe);
    }

    #[test]
    fn reopen_only_when_the_stream_shape_changes() {
        let open = Some((44_100, Encoding::Pcm));
        assert!(!needs_reopen(open, 44_100, Encoding::Pcm));
        assert!(needs_reopen(open, 96_000, Encoding::Pcm));
        assert!(needs_reopen(open, 44_100, Encoding::Dop));
        assert!(needs_reopen(None, 44_100, Encoding::Pcm));
    }

    fn params(buffer_size: usize, period_size: usize, mmap: bool) -> NegotiatedParams {
        NegotiatedParams {
            format: SampleFormat::S32Le,
            rate: 44_100,
            buffer_size,
            period_size,
            mmap,
        }
    }

    #[test]
    fn open_bookkeeping_derives_the_start_threshold() {
        let mut out = OutputState::new("default", 40, 4, 64);
        out.error_opening = true;
        out.frames_played = 99;
        out.frames_played_snapshot = 99;
        out.device_frames = 7;
        out.updated = Some(Instant::now());

        note_session_opened(&mut out, &params(4096, 1024, true));
        assert_eq!(out.start_frames, 2 * 4096);
        assert!(!out.error_opening);
        assert_eq!(out.frames_played, 0);
        assert_eq!(out.frames_played_snapshot, 0);
        assert_eq!(out.device_frames, 0);
        assert!(out.updated.is_none());
    }

    #[test]
    fn batch_clamp_stays_within_the_negotiated_geometry() {
        let direct = params(4096, 1024, true);
        let buffered = params(4096, 1024, false);
        // Negotiation always yields a period no larger than the buffer,
        // so the buffered bound is the tighter of the two.
        assert!(direct.period_size <= direct.buffer_size);
        assert_eq!(batch_clamp(&direct), 4096);
        assert_eq!(batch_clamp(&buffered), 1024);
        assert!(batch_clamp(&buffered) <= batch_clamp(&direct));
    }

    #[test]
    fn failed_kick_reprobes_only_when_the_device_is_gone() {
        assert_eq!(
            kick_failure_action(Some(libc::ENODEV)),
            DeviceAction::Reprobe
        );
        // Recovered or transient failures leave the kick armed.
        assert_eq!(kick_failure_action(None), DeviceAction::Continue);
        assert_eq!(kick_failure_action(Some(libc::EIO)), DeviceAction::Continue);
    }

    #[test]
    fn absent_device_probes_without_raising_open_errors() {
        let shared = OutputState::shared("no-such-device-9f3", 40, 4, 64);
        shared.lock().unwrap().state = PlayerState::Buffering;
        let running = Arc::new(AtomicBool::new(true));
        let worker = spawn(
            shared.clone(),
            running.clone(),
            WorkerOptions {
                probe_device: true,
                ..WorkerOptions::default()
            },
        )
        .unwrap();

        // Give the loop a few passes; with probing requested it must
        // poll for the device instead of failing opens.
        thread::sleep(Duration::from_millis(400));
        assert!(!shared.lock().unwrap().error_opening);
        worker.shutdown();
    }

    #[test]
    fn sliced_sleep_stops_at_shutdown() {
        let running = AtomicBool::new(false);
        let begin = Instant::now();
        sleep_while_running(&running, Duration::from_secs(5));
        assert!(begin.elapsed() < Duration::from_secs(1));
    }
}
