// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! V4L2 wire-compat layer.
//!
//! Everything that touches raw kernel enums or ioctls lives here, so the
//! decoder proper only deals in crate types. The M2M device model: the
//! OUTPUT queue carries compressed input, the CAPTURE queue carries decoded
//! frames.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use thiserror::Error;

use v4l2r::bindings;
use v4l2r::controls::ExtControlTrait;
use v4l2r::controls::SafeExtControl;
use v4l2r::device::poller::DeviceEvent;
use v4l2r::device::poller::PollEvent;
use v4l2r::device::poller::Poller;
use v4l2r::device::Device;
use v4l2r::device::DeviceConfig;
use v4l2r::ioctl;
use v4l2r::ioctl::DecoderCmd;
use v4l2r::ioctl::EventType;
use v4l2r::ioctl::SelectionTarget;
use v4l2r::ioctl::SelectionType;
use v4l2r::ioctl::SrcChanges;
use v4l2r::ioctl::SubscriptionFlags;
use v4l2r::PixelFormat;
use v4l2r::QueueType;

use crate::Rect;
use crate::Resolution;
use crate::VideoCodec;

/// Capture formats the pipeline can hand to the compositor: the flexible
/// 4:2:0 family.
pub const SUPPORTED_CAPTURE_FORMATS: [PixelFormat; 8] = [
    PixelFormat::from_fourcc(b"YU12"),
    PixelFormat::from_fourcc(b"YV12"),
    PixelFormat::from_fourcc(b"YM12"),
    PixelFormat::from_fourcc(b"YM21"),
    PixelFormat::from_fourcc(b"NV12"),
    PixelFormat::from_fourcc(b"NV21"),
    PixelFormat::from_fourcc(b"NM12"),
    PixelFormat::from_fourcc(b"NM21"),
];

/// The compressed pixel format a codec maps to on the OUTPUT queue.
pub fn codec_to_pixel_format(codec: VideoCodec) -> PixelFormat {
    match codec {
        VideoCodec::H264 => PixelFormat::from_fourcc(b"H264"),
        VideoCodec::HEVC => PixelFormat::from_fourcc(b"HEVC"),
        VideoCodec::VP8 => PixelFormat::from_fourcc(b"VP80"),
        VideoCodec::VP9 => PixelFormat::from_fourcc(b"VP90"),
    }
}

/// V4L2_CID_MIN_BUFFERS_FOR_CAPTURE, re-declared as an ext-control so it can
/// go through the SafeExtControl machinery.
pub struct MinBuffersForCapture(pub i32);

impl ExtControlTrait for MinBuffersForCapture {
    const ID: u32 = bindings::V4L2_CID_MIN_BUFFERS_FOR_CAPTURE;
    type PAYLOAD = i32;
}

impl From<MinBuffersForCapture> for i32 {
    fn from(value: MinBuffersForCapture) -> Self {
        value.0
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no M2M device advertises {0} on its OUTPUT queue")]
    NoDeviceForCodec(VideoCodec),

    #[error("device lacks VIDEO_M2M_MPLANE and STREAMING capabilities")]
    MissingCapabilities,

    #[error("failed to query capabilities: {0}")]
    QueryCap(ioctl::QueryCapError),

    #[error("device does not support flushing (V4L2_DEC_CMD_STOP): {0}")]
    FlushUnsupported(ioctl::DecoderCmdError),

    #[error("failed to send decoder command: {0}")]
    DecoderCmd(ioctl::DecoderCmdError),

    #[error("failed to subscribe to the source-change event: {0}")]
    SubscribeEvent(ioctl::SubscribeEventError),

    #[error("failed to create the device poller: {0}")]
    CreatePoller(v4l2r::nix::Error),

    #[error("failed to spawn the poller thread: {0}")]
    SpawnPollerThread(std::io::Error),
}

/// A V4L2 M2M decoder device node.
pub struct VideoDevice {
    device: Arc<Device>,
    path: PathBuf,
}

impl VideoDevice {
    /// Open the first video device whose OUTPUT queue accepts `codec`.
    pub fn open_for_codec(codec: VideoCodec) -> Result<Self, DeviceError> {
        const MAX_DEVICE_NO: usize = 128;

        let pixel_format = codec_to_pixel_format(codec);
        for dev_no in 0..MAX_DEVICE_NO {
            let path = PathBuf::from(format!("/dev/video{dev_no}"));
            let Ok(device) = Device::open(&path, DeviceConfig::new().non_blocking_dqbuf()) else {
                continue;
            };

            let supported = ioctl::FormatIterator::new(&device, QueueType::VideoOutputMplane)
                .any(|fmt| fmt.pixelformat == pixel_format);
            if supported {
                log::info!("using {} for {}", path.display(), codec);
                return Ok(Self {
                    device: Arc::new(device),
                    path,
                });
            }
        }

        Err(DeviceError::NoDeviceForCodec(codec))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// The device must be an M2M streaming device.
    pub fn check_decoder_capabilities(&self) -> Result<(), DeviceError> {
        let caps: bindings::v4l2_capability =
            ioctl::querycap(&*self.device).map_err(DeviceError::QueryCap)?;

        let required = bindings::V4L2_CAP_VIDEO_M2M_MPLANE | bindings::V4L2_CAP_STREAMING;
        if caps.device_caps & required != required {
            return Err(DeviceError::MissingCapabilities);
        }
        Ok(())
    }

    /// Probe flush support by sending a no-op STOP before any buffer is
    /// queued.
    pub fn probe_flush_support(&self) -> Result<(), DeviceError> {
        ioctl::decoder_cmd::<_, ()>(&*self.device, DecoderCmd::stop())
            .map_err(DeviceError::FlushUnsupported)
    }

    pub fn send_start_cmd(&self) -> Result<(), DeviceError> {
        ioctl::decoder_cmd::<_, ()>(&*self.device, DecoderCmd::start())
            .map_err(DeviceError::DecoderCmd)
    }

    pub fn send_stop_cmd(&self) -> Result<(), DeviceError> {
        ioctl::decoder_cmd::<_, ()>(&*self.device, DecoderCmd::stop())
            .map_err(DeviceError::DecoderCmd)
    }

    pub fn subscribe_source_change(&self) -> Result<(), DeviceError> {
        ioctl::subscribe_event(
            &*self.device,
            EventType::SourceChange(0),
            SubscriptionFlags::empty(),
        )
        .map_err(DeviceError::SubscribeEvent)
    }

    /// Drain the event queue; whether a resolution change was signalled.
    pub fn dequeue_resolution_change_event(&self) -> bool {
        while let Ok(event) = ioctl::dqevent(&*self.device) {
            match event {
                ioctl::Event::SrcChangeEvent(changes)
                    if changes.contains(SrcChanges::RESOLUTION) =>
                {
                    return true;
                }
                _ => (),
            }
        }
        false
    }

    /// Capture formats the device offers, restricted to the flexible 4:2:0
    /// family, in the device's preference order.
    pub fn supported_capture_formats(&self) -> Vec<PixelFormat> {
        ioctl::FormatIterator::new(&*self.device, QueueType::VideoCaptureMplane)
            .map(|fmt| fmt.pixelformat)
            .filter(|pixfmt| {
                let supported = SUPPORTED_CAPTURE_FORMATS.contains(pixfmt);
                if !supported {
                    log::debug!("pixel format {} is not supported, skipping", pixfmt);
                }
                supported
            })
            .collect()
    }

    /// The smallest frame size the device decodes to in `pixel_format`,
    /// falling back to 128x128 when the query gives nothing usable.
    pub fn min_supported_resolution(&self, pixel_format: PixelFormat) -> Resolution {
        const FALLBACK: Resolution = Resolution {
            width: 128,
            height: 128,
        };

        let sizes: bindings::v4l2_frmsizeenum =
            match ioctl::enum_frame_sizes(&*self.device, 0, pixel_format) {
                Ok(sizes) => sizes,
                Err(e) => {
                    log::debug!("failed to enumerate frame sizes for {pixel_format}: {e:?}");
                    return FALLBACK;
                }
            };

        let min = match sizes.size() {
            Some(ioctl::FrmSizeTypes::StepWise(stepwise)) => {
                Resolution::new(stepwise.min_width, stepwise.min_height)
            }
            Some(ioctl::FrmSizeTypes::Discrete(discrete)) => {
                Resolution::new(discrete.width, discrete.height)
            }
            None => Resolution::default(),
        };
        if min.is_empty() {
            FALLBACK
        } else {
            min
        }
    }

    /// The driver's minimum number of capture buffers, from
    /// V4L2_CID_MIN_BUFFERS_FOR_CAPTURE.
    pub fn min_num_capture_buffers(&self) -> Option<usize> {
        let mut ctrl = SafeExtControl::<MinBuffersForCapture>::from_value(0);
        match ioctl::g_ext_ctrls(&*self.device, ioctl::CtrlWhich::Current, &mut ctrl) {
            Ok(()) => Some(ctrl.value() as usize),
            Err(e) => {
                log::error!("failed to query minimum capture buffer count: {e:?}");
                None
            }
        }
    }

    /// The visible rectangle of decoded pictures, read through the selection
    /// API with a crop fallback. An empty or out-of-range rectangle is
    /// replaced by the whole coded size.
    pub fn visible_rect(&self, coded_size: Resolution) -> Rect {
        let selection: Result<v4l2r::Rect, _> = ioctl::g_selection(
            &*self.device,
            SelectionType::Capture,
            SelectionTarget::Compose,
        );
        let raw = match selection {
            Ok(rect) => rect,
            Err(_) => {
                log::debug!("G_SELECTION is not supported, falling back to the crop target");
                match ioctl::g_selection(
                    &*self.device,
                    SelectionType::Capture,
                    SelectionTarget::Crop,
                ) {
                    Ok(rect) => rect,
                    Err(e) => {
                        log::warn!("failed to query the visible rectangle: {e}");
                        return Rect::from(coded_size);
                    }
                }
            }
        };

        let rect = Rect {
            left: raw.left,
            top: raw.top,
            width: raw.width,
            height: raw.height,
        };
        if !rect.is_contained_by(coded_size) {
            log::warn!("visible rectangle {rect} is not inside coded size {coded_size}");
            return Rect::from(coded_size);
        }
        if rect.is_empty() {
            log::warn!("visible rectangle is empty");
            return Rect::from(coded_size);
        }

        rect
    }
}

/// Waker token distinguishing poll interruptions from device activity.
const WAKER_ID: u32 = 0;

struct PollerState {
    /// Whether a buffer poll has been requested since the last one.
    poll_scheduled: Mutex<bool>,
    scheduled_cond: Condvar,
    stop: AtomicBool,
}

/// A dedicated thread blocking on the device so the decoder runner never has
/// to. Results are reported through the callbacks, which are expected to
/// post back to the decoder runner; the poll thread itself never touches
/// decoder state.
pub struct DevicePoller {
    state: Arc<PollerState>,
    waker: Arc<v4l2r::device::poller::Waker>,
    thread: Option<JoinHandle<()>>,
}

impl DevicePoller {
    /// Start polling `device`. `event_cb(event_pending)` fires when buffer or
    /// event progress is possible; `error_cb` fires once on a poll failure.
    pub fn start(
        device: Arc<Device>,
        event_cb: impl Fn(bool) + Send + 'static,
        error_cb: impl FnOnce() + Send + 'static,
    ) -> Result<Self, DeviceError> {
        let mut poller = Poller::new(device).map_err(DeviceError::CreatePoller)?;
        poller
            .enable_event(DeviceEvent::V4l2Event)
            .map_err(DeviceError::CreatePoller)?;
        let waker = poller.add_waker(WAKER_ID).map_err(DeviceError::CreatePoller)?;

        let state = Arc::new(PollerState {
            poll_scheduled: Mutex::new(false),
            scheduled_cond: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let thread_state = state.clone();
        let thread = thread::Builder::new()
            .name("device_poller".into())
            .spawn(move || Self::poll_loop(poller, thread_state, event_cb, error_cb))
            .map_err(DeviceError::SpawnPollerThread)?;

        Ok(Self {
            state,
            waker,
            thread: Some(thread),
        })
    }

    /// Request one buffer poll. Cheap to call repeatedly; an already-pending
    /// request is not duplicated.
    pub fn schedule_poll(&self) {
        let mut scheduled = self.state.poll_scheduled.lock().unwrap();
        if !*scheduled {
            *scheduled = true;
            self.state.scheduled_cond.notify_all();
            // Interrupt an in-flight poll so it restarts with buffer events
            // enabled.
            if let Err(e) = self.waker.wake() {
                log::error!("failed to interrupt device poll: {e}");
            }
        }
    }

    fn poll_loop(
        mut poller: Poller,
        state: Arc<PollerState>,
        event_cb: impl Fn(bool),
        error_cb: impl FnOnce(),
    ) {
        let mut buffer_events_enabled = false;
        loop {
            // Wait until a poll is wanted.
            {
                let mut scheduled = state.poll_scheduled.lock().unwrap();
                while !*scheduled && !state.stop.load(Ordering::SeqCst) {
                    scheduled = state.scheduled_cond.wait(scheduled).unwrap();
                }
                *scheduled = false;
            }
            if state.stop.load(Ordering::SeqCst) {
                return;
            }

            if !buffer_events_enabled {
                let enabled = poller
                    .enable_event(DeviceEvent::CaptureReady)
                    .and_then(|_| poller.enable_event(DeviceEvent::OutputReady));
                if let Err(e) = enabled {
                    log::error!("failed to enable buffer polling: {e}");
                    error_cb();
                    return;
                }
                buffer_events_enabled = true;
            }

            let events = match poller.poll(None) {
                Ok(events) => events,
                Err(e) => {
                    log::error!("error while polling device: {e}");
                    error_cb();
                    return;
                }
            };

            let mut event_pending = false;
            let mut buffers_pending = false;
            for event in events {
                match event {
                    PollEvent::Device(DeviceEvent::V4l2Event) => event_pending = true,
                    PollEvent::Device(_) => buffers_pending = true,
                    PollEvent::Waker(_) => (),
                }
            }

            if buffers_pending || event_pending {
                event_cb(event_pending);
            } else {
                // Interrupted before anything was ready; poll again.
                let mut scheduled = state.poll_scheduled.lock().unwrap();
                *scheduled = true;
            }
        }
    }

    fn stop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        self.state.scheduled_cond.notify_all();
        if let Err(e) = self.waker.wake() {
            log::error!("failed to interrupt device poll for shutdown: {e}");
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DevicePoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_pixel_formats() {
        assert_eq!(
            codec_to_pixel_format(VideoCodec::H264),
            PixelFormat::from_fourcc(b"H264")
        );
        assert_eq!(
            codec_to_pixel_format(VideoCodec::VP9),
            PixelFormat::from_fourcc(b"VP90")
        );
    }

    #[test]
    fn flexible_420_set() {
        assert!(SUPPORTED_CAPTURE_FORMATS.contains(&PixelFormat::from_fourcc(b"NV12")));
        assert!(!SUPPORTED_CAPTURE_FORMATS.contains(&PixelFormat::from_fourcc(b"RGB3")));
    }
}
