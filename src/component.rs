// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The public decode component façade.
//!
//! Client threads call in concurrently; a short-held entry lock serializes
//! them, and every state-bearing operation is posted to the component's
//! serial task runner. `start`, `stop`, `flush` and `set_listener` block on
//! the posted task; everything else returns right after posting.

use std::collections::BTreeMap;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::Mutex;

use crate::codec;
use crate::codec::nalu::NaluWalker;
use crate::decoder::BitstreamBuffer;
use crate::decoder::DecodeStatus;
use crate::decoder::Decoder;
use crate::interface::DecodeInterface;
use crate::surface_pool::ProducerQueue;
use crate::surface_pool::SurfacePool;
use crate::surface_pool::VideoFrame;
use crate::task_runner::SerialTaskRunner;
use crate::VideoCodec;

/// Status codes of the component surface. Numerical values follow the
/// errno-based convention of the framework headers.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ComponentStatus {
    Ok = 0,
    BadState = 1,    // EPERM
    NoMemory = 12,   // ENOMEM
    Corrupted = 14,  // EFAULT
    BadValue = 22,   // EINVAL
    Omitted = 38,    // ENOSYS
    TimedOut = 110,  // ETIMEDOUT
}

/// A finished unit of work handed back through the listener.
#[derive(Debug)]
pub struct DecodeWork {
    pub bitstream_id: i32,
    pub status: DecodeStatus,
    /// The decoded picture, when this input produced one.
    pub frame: Option<VideoFrame>,
}

/// Receives completed work and component-level events. Implemented by the
/// embedding framework glue; called on the component's task runner.
pub trait ComponentListener: Send + Sync {
    fn on_work_done(&self, work: DecodeWork);
    fn on_drain_done(&self, status: ComponentStatus);
    fn on_error(&self, status: ComponentStatus);
}

/// Hands out the consumer-side buffer queue backing the output surfaces.
/// Invoked on the component task runner at every resolution change.
pub type ProducerFactory = Box<dyn FnMut() -> Option<Box<dyn ProducerQueue>> + Send + 'static>;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum ComponentState {
    Stopped,
    Running,
    Released,
    Error,
}

/// Work submitted to the decoder that has not been reported back yet.
struct PendingWork {
    input_consumed: bool,
    status: DecodeStatus,
    frame: Option<VideoFrame>,
}

struct ComponentInner {
    decoder: Option<Arc<Mutex<Decoder>>>,
    listener: Option<Arc<dyn ComponentListener>>,
    works: BTreeMap<i32, PendingWork>,
    producer_factory: ProducerFactory,
    interface: Arc<Mutex<DecodeInterface>>,
    codec: VideoCodec,
    is_secure: bool,
}

impl ComponentInner {
    fn report_work(&mut self, bitstream_id: i32, work: PendingWork) {
        if let Some(listener) = &self.listener {
            listener.on_work_done(DecodeWork {
                bitstream_id,
                status: work.status,
                frame: work.frame,
            });
        }
    }

    /// Report every work up to and including `up_to` whose input was
    /// consumed. The one matching frame rides along; earlier ones go out
    /// empty.
    fn report_finished_works(&mut self, up_to: i32) {
        let ready: Vec<i32> = self
            .works
            .range(..=up_to)
            .filter(|(_, work)| work.input_consumed)
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            if let Some(work) = self.works.remove(&id) {
                self.report_work(id, work);
            }
        }
    }

    fn report_abandoned_works(&mut self) {
        let works = std::mem::take(&mut self.works);
        for (id, mut work) in works {
            work.status = DecodeStatus::Aborted;
            work.frame = None;
            self.report_work(id, work);
        }
    }

    fn on_decode_done(&mut self, bitstream_id: i32, status: DecodeStatus) {
        let Some(work) = self.works.get_mut(&bitstream_id) else {
            log::debug!("work {bitstream_id} already reported");
            return;
        };
        work.input_consumed = true;
        work.status = status;
        match status {
            // Completion order tells nothing about output; frames drive the
            // reporting.
            DecodeStatus::Ok => (),
            DecodeStatus::Aborted | DecodeStatus::Error => {
                if let Some(work) = self.works.remove(&bitstream_id) {
                    self.report_work(bitstream_id, work);
                }
            }
        }
    }

    fn on_output_frame_ready(&mut self, mut frame: VideoFrame) {
        let Some(bitstream_id) = frame.bitstream_id() else {
            log::error!("decoded frame carries no bitstream id");
            self.report_error(ComponentStatus::Corrupted);
            return;
        };

        // The frame travels across the IPC boundary from here on; its
        // producer slot must not be cancelled when the client drops it.
        frame.mark_shared();

        match self.works.get_mut(&bitstream_id) {
            Some(work) => work.frame = Some(frame),
            None => {
                log::warn!("no pending work for decoded frame {bitstream_id}");
                return;
            }
        }
        self.report_finished_works(bitstream_id);
    }

    fn on_drain_done(&mut self, status: DecodeStatus) {
        // Whatever was consumed but produced no picture is complete now.
        let ready: Vec<i32> = self
            .works
            .iter()
            .filter(|(_, work)| work.input_consumed)
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            if let Some(work) = self.works.remove(&id) {
                self.report_work(id, work);
            }
        }

        if let Some(listener) = &self.listener {
            listener.on_drain_done(match status {
                DecodeStatus::Ok => ComponentStatus::Ok,
                DecodeStatus::Aborted => ComponentStatus::BadState,
                DecodeStatus::Error => ComponentStatus::Corrupted,
            });
        }
    }

    fn report_error(&self, status: ComponentStatus) {
        if let Some(listener) = &self.listener {
            listener.on_error(status);
        }
    }

    /// Peek at a clear-stream input for an SPS and refresh the coded color
    /// aspects. Only H.264 and HEVC carry them; secure H.264 payloads cannot
    /// be read.
    fn update_coded_color_aspects(&mut self, input: &BitstreamBuffer) {
        if self.is_secure {
            return;
        }
        let parse_sps: fn(&[u8]) -> Option<codec::ParseResult<Option<codec::ColorAspects>>> =
            match self.codec {
                VideoCodec::H264 => |data| {
                    let mut walker = NaluWalker::h264(data);
                    walker
                        .locate_sps()
                        .then(|| codec::h264::parse_color_aspects(walker.nalu()))
                },
                VideoCodec::HEVC => |data| {
                    let mut walker = NaluWalker::hevc(data);
                    walker
                        .locate_sps()
                        .then(|| codec::h265::parse_color_aspects(walker.nalu()))
                },
                _ => return,
            };

        let mut payload = vec![0u8; input.size as usize];
        if input
            .dmabuf
            .read_exact_at(&mut payload, input.offset as u64)
            .is_err()
        {
            return;
        }

        match parse_sps(&payload) {
            Some(Ok(Some(aspects))) => {
                log::debug!("stream color aspects: {aspects:?}");
                self.interface.lock().unwrap().set_coded_color_aspects(aspects);
            }
            Some(Ok(None)) | None => (),
            Some(Err(e)) => log::warn!("failed to parse SPS color aspects: {e}"),
        }
    }
}

/// Process-wide running-component accounting, capped by the
/// `V4L2_CODEC2_DECODE_CONCURRENT_INSTANCES` environment knob (unlimited
/// when unset).
static CONCURRENT_INSTANCES: Mutex<i32> = Mutex::new(0);

fn max_concurrent_instances() -> i32 {
    std::env::var("V4L2_CODEC2_DECODE_CONCURRENT_INSTANCES")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(-1)
}

struct InstanceGuard;

impl InstanceGuard {
    fn acquire() -> Option<InstanceGuard> {
        let mut count = CONCURRENT_INSTANCES.lock().unwrap();
        let max = max_concurrent_instances();
        if max >= 0 && *count >= max {
            log::warn!("rejecting component creation, too many instances: {}", *count);
            return None;
        }
        *count += 1;
        Some(InstanceGuard)
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        *CONCURRENT_INSTANCES.lock().unwrap() -= 1;
    }
}

/// The decode component: public façade over the decoder, the surface pool
/// and the interface.
pub struct DecodeComponent {
    /// Serializes the public entry points against concurrent callers.
    api_lock: Mutex<()>,
    state: Mutex<ComponentState>,
    runner: Option<SerialTaskRunner>,
    inner: Arc<Mutex<ComponentInner>>,
    interface: Arc<Mutex<DecodeInterface>>,
    _guard: InstanceGuard,
}

impl DecodeComponent {
    /// Create a stopped component named `name` (the `.secure` suffix selects
    /// secure mode). `producer_factory` supplies the consumer-side buffer
    /// queue each time the output surfaces are (re)negotiated.
    pub fn create(
        name: &str,
        codec: VideoCodec,
        producer_factory: ProducerFactory,
    ) -> Result<DecodeComponent, ComponentStatus> {
        let guard = InstanceGuard::acquire().ok_or(ComponentStatus::NoMemory)?;

        let interface = Arc::new(Mutex::new(DecodeInterface::new(name, codec)));
        let is_secure = interface.lock().unwrap().is_secure();
        let runner =
            SerialTaskRunner::new("decode_component").map_err(|_| ComponentStatus::Corrupted)?;

        let inner = Arc::new(Mutex::new(ComponentInner {
            decoder: None,
            listener: None,
            works: BTreeMap::new(),
            producer_factory,
            interface: interface.clone(),
            codec,
            is_secure,
        }));

        Ok(DecodeComponent {
            api_lock: Mutex::new(()),
            state: Mutex::new(ComponentState::Stopped),
            runner: Some(runner),
            inner,
            interface,
            _guard: guard,
        })
    }

    pub fn interface(&self) -> Arc<Mutex<DecodeInterface>> {
        self.interface.clone()
    }

    /// Block until the listener is installed. Must not be called while work
    /// is in flight.
    pub fn set_listener(&self, listener: Option<Arc<dyn ComponentListener>>) -> ComponentStatus {
        let _lock = self.api_lock.lock().unwrap();

        let inner = self.inner.clone();
        let done = self.post_and_wait(move || {
            inner.lock().unwrap().listener = listener;
        });
        match done {
            Some(()) => ComponentStatus::Ok,
            None => ComponentStatus::Corrupted,
        }
    }

    /// Start the decoder; blocks until it is running. The component must be
    /// stopped.
    pub fn start(&self) -> ComponentStatus {
        let _lock = self.api_lock.lock().unwrap();

        {
            let state = self.state.lock().unwrap();
            if *state != ComponentState::Stopped {
                return ComponentStatus::BadState;
            }
        }

        let Some(runner) = self.runner.as_ref() else {
            return ComponentStatus::BadState;
        };
        let runner_handle = runner.handle();
        let inner = self.inner.clone();
        let interface = self.interface.clone();

        let started = self.post_and_wait(move || {
            let (codec, input_buffer_size, min_num_output_buffers, is_secure) = {
                let interface = interface.lock().unwrap();
                (
                    interface.video_codec(),
                    interface.input_buffer_size(),
                    interface.min_num_output_buffers(),
                    interface.is_secure(),
                )
            };

            let pool_inner = inner.clone();
            let pool_runner = runner_handle.clone();
            let output_inner = inner.clone();
            let error_inner = inner.clone();

            let decoder = Decoder::create(
                codec,
                input_buffer_size,
                min_num_output_buffers,
                // Invoked on the decoder runner at each resolution change.
                Box::new(move |coded_size, pixel_format, num_buffers| {
                    let pool = SurfacePool::new(pool_runner.clone()).ok()?;
                    let producer = (pool_inner.lock().unwrap().producer_factory)()?;
                    pool.configure_producer(Some(producer));
                    let (width, height) = coded_size.into();
                    let usage = crate::surface_pool::USAGE_VIDEO_DECODER;
                    match pool.request_buffer_set(num_buffers, width, height, pixel_format, usage)
                    {
                        Ok(()) => Some(pool),
                        Err(e) => {
                            log::error!("failed to request the new buffer set: {e}");
                            None
                        }
                    }
                }),
                Box::new(move |frame| {
                    output_inner.lock().unwrap().on_output_frame_ready(frame);
                }),
                Box::new(move || {
                    let inner = error_inner.lock().unwrap();
                    inner.report_error(ComponentStatus::Corrupted);
                }),
                runner_handle.clone(),
                is_secure,
            );

            match decoder {
                Ok(decoder) => {
                    inner.lock().unwrap().decoder = Some(decoder);
                    ComponentStatus::Ok
                }
                Err(e) => {
                    log::error!("failed to create the decoder: {e}");
                    ComponentStatus::Corrupted
                }
            }
        });

        match started {
            Some(ComponentStatus::Ok) => {
                *self.state.lock().unwrap() = ComponentState::Running;
                ComponentStatus::Ok
            }
            Some(status) => {
                *self.state.lock().unwrap() = ComponentState::Error;
                status
            }
            None => ComponentStatus::Corrupted,
        }
    }

    /// Stop the decoder and abandon in-flight work; blocks until torn down.
    /// Also the path out of the error state.
    pub fn stop(&self) -> ComponentStatus {
        let _lock = self.api_lock.lock().unwrap();

        {
            let state = self.state.lock().unwrap();
            if !matches!(*state, ComponentState::Running | ComponentState::Error) {
                return ComponentStatus::BadState;
            }
        }

        let inner = self.inner.clone();
        let stopped = self.post_and_wait(move || {
            let mut inner = inner.lock().unwrap();
            // Dropping the decoder streams off and deallocates both queues
            // and stops polling.
            inner.decoder = None;
            inner.report_abandoned_works();
        });

        match stopped {
            Some(()) => {
                *self.state.lock().unwrap() = ComponentState::Stopped;
                ComponentStatus::Ok
            }
            None => ComponentStatus::Corrupted,
        }
    }

    /// Equivalent to stop for this component; the interface keeps its
    /// configuration.
    pub fn reset(&self) -> ComponentStatus {
        log::debug!("reset()");
        self.stop()
    }

    /// Final teardown; the component cannot be started again.
    pub fn release(&mut self) -> ComponentStatus {
        {
            let state = self.state.lock().unwrap();
            if *state == ComponentState::Running {
                drop(state);
                self.stop();
            }
        }

        let _lock = self.api_lock.lock().unwrap();
        self.runner = None;
        *self.state.lock().unwrap() = ComponentState::Released;
        ComponentStatus::Ok
    }

    /// Queue one compressed buffer for decoding. Non-blocking.
    pub fn queue(&self, input: BitstreamBuffer) -> ComponentStatus {
        let _lock = self.api_lock.lock().unwrap();

        if *self.state.lock().unwrap() != ComponentState::Running {
            return ComponentStatus::BadState;
        }

        let inner = self.inner.clone();
        let posted = self.post(move || {
            let bitstream_id = input.id;
            let mut inner_guard = inner.lock().unwrap();
            inner_guard.update_coded_color_aspects(&input);
            inner_guard.works.insert(
                bitstream_id,
                PendingWork {
                    input_consumed: false,
                    status: DecodeStatus::Ok,
                    frame: None,
                },
            );
            let Some(decoder) = inner_guard.decoder.clone() else {
                inner_guard.report_error(ComponentStatus::BadState);
                return;
            };
            drop(inner_guard);

            let done_inner = inner.clone();
            decoder.lock().unwrap().decode(
                input,
                Box::new(move |status| {
                    done_inner
                        .lock()
                        .unwrap()
                        .on_decode_done(bitstream_id, status);
                }),
            );
        });

        if posted {
            ComponentStatus::Ok
        } else {
            ComponentStatus::BadState
        }
    }

    /// Signal end of stream; completion arrives through the listener.
    /// Non-blocking.
    pub fn drain(&self) -> ComponentStatus {
        let _lock = self.api_lock.lock().unwrap();

        if *self.state.lock().unwrap() != ComponentState::Running {
            return ComponentStatus::BadState;
        }

        let inner = self.inner.clone();
        let posted = self.post(move || {
            let Some(decoder) = inner.lock().unwrap().decoder.clone() else {
                return;
            };
            let done_inner = inner.clone();
            decoder.lock().unwrap().drain(Box::new(move |status| {
                done_inner.lock().unwrap().on_drain_done(status);
            }));
        });

        if posted {
            ComponentStatus::Ok
        } else {
            ComponentStatus::BadState
        }
    }

    /// Discard every in-flight request; blocks until the decoder is idle
    /// again. Abandoned work is reported through the listener with an
    /// aborted status.
    pub fn flush(&self) -> ComponentStatus {
        let _lock = self.api_lock.lock().unwrap();

        if *self.state.lock().unwrap() != ComponentState::Running {
            return ComponentStatus::BadState;
        }

        let inner = self.inner.clone();
        let flushed = self.post_and_wait(move || {
            let decoder = inner.lock().unwrap().decoder.clone();
            if let Some(decoder) = decoder {
                // Pending decode callbacks fire with Aborted from inside.
                decoder.lock().unwrap().flush();
            }
            inner.lock().unwrap().report_abandoned_works();
        });

        match flushed {
            Some(()) => ComponentStatus::Ok,
            None => ComponentStatus::Corrupted,
        }
    }

    /// Pre-announcement of future work is not supported by this component.
    pub fn announce(&self) -> ComponentStatus {
        ComponentStatus::Omitted
    }

    fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        match self.runner.as_ref() {
            Some(runner) => runner.handle().post(task),
            None => false,
        }
    }

    fn post_and_wait<R: Send + 'static>(
        &self,
        task: impl FnOnce() -> R + Send + 'static,
    ) -> Option<R> {
        self.runner
            .as_ref()
            .and_then(|runner| runner.handle().post_and_wait(task))
    }
}

impl Drop for DecodeComponent {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn null_factory() -> ProducerFactory {
        Box::new(|| None)
    }

    struct RecordingListener {
        tx: Mutex<mpsc::Sender<DecodeWork>>,
    }

    impl ComponentListener for RecordingListener {
        fn on_work_done(&self, work: DecodeWork) {
            let _ = self.tx.lock().unwrap().send(work);
        }
        fn on_drain_done(&self, _status: ComponentStatus) {}
        fn on_error(&self, _status: ComponentStatus) {}
    }

    #[test]
    fn entry_points_require_matching_state() {
        let component =
            DecodeComponent::create("c2.v4l2.avc.decoder", VideoCodec::H264, null_factory())
                .unwrap();

        // Not running yet.
        assert_eq!(component.drain(), ComponentStatus::BadState);
        assert_eq!(component.flush(), ComponentStatus::BadState);
        assert_eq!(component.stop(), ComponentStatus::BadState);
        assert_eq!(component.announce(), ComponentStatus::Omitted);
    }

    #[test]
    fn interface_reflects_component_name() {
        let component =
            DecodeComponent::create("c2.v4l2.hevc.decoder.secure", VideoCodec::HEVC, null_factory())
                .unwrap();
        let interface = component.interface();
        let interface = interface.lock().unwrap();
        assert!(interface.is_secure());
        assert_eq!(interface.video_codec(), VideoCodec::HEVC);
        assert_eq!(interface.output_delay(), 16);
    }

    #[test]
    fn release_prevents_further_use() {
        let mut component =
            DecodeComponent::create("c2.v4l2.vp9.decoder", VideoCodec::VP9, null_factory())
                .unwrap();
        assert_eq!(component.release(), ComponentStatus::Ok);
        assert_eq!(component.start(), ComponentStatus::BadState);
        assert_eq!(
            component.set_listener(None),
            ComponentStatus::Corrupted
        );
    }

    #[test]
    fn listener_is_installed_synchronously() {
        let component =
            DecodeComponent::create("c2.v4l2.vp8.decoder", VideoCodec::VP8, null_factory())
                .unwrap();
        let (tx, _rx) = mpsc::channel();
        let listener: Arc<dyn ComponentListener> =
            Arc::new(RecordingListener { tx: Mutex::new(tx) });
        assert_eq!(component.set_listener(Some(listener)), ComponentStatus::Ok);
    }

    #[test]
    fn unlimited_instances_by_default() {
        let components: Vec<_> = (0..8)
            .map(|_| {
                DecodeComponent::create("c2.v4l2.avc.decoder", VideoCodec::H264, null_factory())
            })
            .collect();
        assert!(components.iter().all(|component| component.is_ok()));
    }
}
