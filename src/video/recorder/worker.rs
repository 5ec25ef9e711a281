//! Recorder worker loop

use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

use super::{draw_overlays, Control, RecorderState, Shared};
use crate::camera::CameraFrameGuard;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::{error_throttled, warn_throttled};

pub(super) fn spawn(shared: Arc<Shared>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("video-recorder".to_string())
        .spawn(move || run(shared))
        .map_err(|e| AppError::Runtime(format!("failed to spawn recorder worker: {}", e)))
}

fn run(shared: Arc<Shared>) {
    let throttle = LogThrottler::with_secs(5);
    debug!("Recorder worker started");

    loop {
        let mut control = shared.control.lock();
        if shared.exit.load(Ordering::Acquire) {
            break;
        }

        let sleep = match control.state {
            RecorderState::Idle => {
                preview(&mut control, &throttle);
                Some(control.idle_sleep)
            }
            RecorderState::Record => {
                if let Err(e) = record_frame(&mut control, &shared, &throttle) {
                    log_frame_error("record", &e, &throttle);
                }
                None
            }
            RecorderState::DisplayOnly | RecorderState::Unknown => Some(control.idle_sleep),
        };

        // hand the lock to a waiting control call before the next frame
        MutexGuard::unlock_fair(control);
        if let Some(sleep) = sleep.filter(|d| !d.is_zero()) {
            std::thread::sleep(sleep);
        }
    }

    debug!("Recorder worker stopped");
}

fn log_frame_error(stage: &str, e: &AppError, throttle: &LogThrottler) {
    if e.is_timeout() {
        trace!("Recorder {} timed out: {}", stage, e);
        return;
    }
    match stage {
        "record" => error_throttled!(throttle, "recorder_record", "Recording frame failed: {}", e),
        "snapshot" => warn_throttled!(throttle, "recorder_snapshot", "Snapshot read failed: {}", e),
        _ => warn_throttled!(throttle, "recorder_preview", "Preview frame failed: {}", e),
    }
}

/// Show one camera frame and refresh the snapshot cache
fn preview(control: &mut Control, throttle: &LogThrottler) {
    if let Some(camera) = control.camera.clone() {
        match CameraFrameGuard::read(camera.as_ref(), control.camera_timeout) {
            Ok(frame) => {
                if let Some(display) = &control.display {
                    if let Err(e) = display.push(frame.image(), control.fit) {
                        log_frame_error("preview", &e, throttle);
                    }
                }
            }
            Err(e) => log_frame_error("preview", &e, throttle),
        }
    }

    if !control.snapshot_enabled {
        return;
    }
    if let Some(camera) = control.snapshot_camera.clone() {
        match CameraFrameGuard::read(camera.as_ref(), control.camera_timeout) {
            Ok(frame) => control.snapshot = Some(frame.image().to_owned_image()),
            Err(e) => log_frame_error("snapshot", &e, throttle),
        }
    }
}

/// Pull audio, overlay, encode and display one frame
fn record_frame(control: &mut Control, shared: &Shared, throttle: &LogThrottler) -> Result<()> {
    let camera = control
        .camera
        .clone()
        .ok_or_else(|| AppError::NotReady("recording without a camera".to_string()))?;
    let audio_bytes = control.session.as_ref().map(|s| s.audio_bytes).unwrap_or(0);

    let pcm = match (&control.audio, audio_bytes) {
        (Some(audio), n) if n > 0 => match audio.record_bytes(n) {
            Ok(pcm) => Some(pcm),
            Err(e) => {
                warn_throttled!(throttle, "recorder_audio", "Audio read failed: {}", e);
                None
            }
        },
        _ => None,
    };

    let mut frame = CameraFrameGuard::read(camera.as_ref(), control.camera_timeout)?;
    // the display gets the frame as captured, overlays only go to the file
    let raw = (control.display.is_some() && control.rects.iter().any(|r| r.visible))
        .then(|| frame.image().to_owned_image());
    draw_overlays(frame.image_mut(), &control.rects);

    let session = control
        .session
        .as_mut()
        .ok_or_else(|| AppError::NotReady("recording session missing".to_string()))?;
    session.encoder.encode(Some(frame.image()), pcm.as_deref())?;
    if let Some(muxer) = session.encoder.muxer() {
        shared.seek_ms.store(muxer.position_ms(), Ordering::Relaxed);
    }
    control.frames += 1;

    if let Some(display) = &control.display {
        let shown = raw.as_ref().unwrap_or_else(|| frame.image());
        if let Err(e) = display.push(shown, control.fit) {
            log_frame_error("preview", &e, throttle);
        }
    }
    Ok(())
}
