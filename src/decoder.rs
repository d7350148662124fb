// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The stateful decode state machine.
//!
//! Compressed payloads go in through the V4L2 OUTPUT queue ("input queue"
//! here), decoded pictures come back on the CAPTURE queue ("output queue"),
//! backed by DMA surfaces from the [`crate::surface_pool`]. All methods run
//! on the decoder task runner; the device poller and the surface pool post
//! back onto it.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use anyhow::anyhow;
use anyhow::Context;
use nix::sys::stat::fstat;
use thiserror::Error;

use v4l2r::bindings::v4l2_plane;
use v4l2r::device::queue::direction::Capture;
use v4l2r::device::queue::direction::Output;
use v4l2r::device::queue::qbuf::get_free::GetFreeCaptureBuffer;
use v4l2r::device::queue::qbuf::get_free::GetFreeOutputBuffer;
use v4l2r::device::queue::qbuf::get_indexed::GetCaptureBufferByIndex;
use v4l2r::device::queue::qbuf::get_indexed::GetOutputBufferByIndex;
use v4l2r::device::queue::qbuf::CaptureQueueable;
use v4l2r::device::queue::qbuf::OutputQueueable;
use v4l2r::device::queue::BuffersAllocated;
use v4l2r::device::queue::Queue;
use v4l2r::device::queue::QueueInit;
use v4l2r::device::AllocatedQueue;
use v4l2r::device::Stream;
use v4l2r::device::TryDequeue;
use v4l2r::ioctl;
use v4l2r::memory::BufferHandles;
use v4l2r::memory::MemoryType;
use v4l2r::nix::sys::time::TimeVal;
use v4l2r::Format;
use v4l2r::PlaneLayout;

use crate::codec::contains_keyframe;
use crate::device::DeviceError;
use crate::device::DevicePoller;
use crate::device::VideoDevice;
use crate::surface_pool::FrameWithUniqueId;
use crate::surface_pool::GraphicBlock;
use crate::surface_pool::HalPixelFormat;
use crate::surface_pool::PlaneFd;
use crate::surface_pool::SurfacePool;
use crate::surface_pool::VideoFrame;
use crate::surface_pool::USAGE_VIDEO_DECODER;
use crate::task_runner::TaskRunnerHandle;
use crate::Rect;
use crate::Resolution;
use crate::VideoCodec;

/// Number of slots on the input queue. The framework pipeline depth is tuned
/// so that, in the common case, every client buffer keeps hitting the slot
/// that already maps its DMA buffer.
pub const NUM_INPUT_BUFFERS: usize = 16;

/// Extra output buffers for transmitting in the whole video pipeline.
const NUM_EXTRA_OUTPUT_BUFFERS: usize = 4;

/// Outcome of a decode or drain request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    Ok,
    Aborted,
    Error,
}

/// A reference to compressed input: a DMA fd plus the client-assigned
/// monotonically increasing bitstream id used to correlate completions.
#[derive(Debug)]
pub struct BitstreamBuffer {
    pub id: i32,
    pub dmabuf: File,
    pub offset: u32,
    pub size: u32,
}

pub type DecodeCb = Box<dyn FnOnce(DecodeStatus) + Send + 'static>;
pub type OutputCb = Box<dyn FnMut(VideoFrame) + Send + 'static>;
pub type ErrorCb = Box<dyn FnOnce() + Send + 'static>;
/// Asks the component for a new surface pool sized for the negotiated coded
/// size.
pub type GetPoolCb =
    Box<dyn FnMut(Resolution, HalPixelFormat, usize) -> Option<SurfacePool> + Send + 'static>;

struct DecodeRequest {
    /// `None` marks a drain request.
    buffer: Option<BitstreamBuffer>,
    cb: DecodeCb,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Decoding,
    Draining,
    Error,
}

/// The state relation is total: Draining is only reachable from Decoding,
/// and Error absorbs everything.
fn apply_transition(current: State, target: State) -> State {
    if current == target {
        return current;
    }
    match (current, target) {
        (State::Error, _) => State::Error,
        (State::Decoding, State::Draining) => State::Draining,
        (_, State::Draining) => State::Error,
        (_, target) => target,
    }
}

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("input codec is not supported by the device")]
    UnsupportedCodec,

    #[error("failed to create a queue: {0}")]
    CreateQueue(v4l2r::device::queue::CreateQueueError),

    #[error("failed to set the input format: {0}")]
    SetInputFormat(ioctl::SFmtError),

    #[error("failed to request input buffers: {0}")]
    RequestInputBuffers(v4l2r::device::queue::RequestBuffersError),

    #[error("failed to stream on the input queue: {0}")]
    StreamOnInput(ioctl::StreamOnError),

    #[error("failed to set up the initial output queue: {0}")]
    InitialOutput(anyhow::Error),
}

/// Per-slot record of the DMA buffer identity last queued on the input
/// queue. A slot's entry is present iff the slot has ever been used.
struct BitstreamRing {
    last_dma_id: [Option<u64>; NUM_INPUT_BUFFERS],
}

impl BitstreamRing {
    fn new() -> Self {
        Self {
            last_dma_id: [None; NUM_INPUT_BUFFERS],
        }
    }

    /// The slot to try first for `dma_id`: the slot that last carried this
    /// buffer, else a slot that has never been used.
    fn preferred_slot(&self, dma_id: u64) -> Option<usize> {
        self.last_dma_id
            .iter()
            .position(|id| *id == Some(dma_id))
            .or_else(|| self.last_dma_id.iter().position(|id| id.is_none()))
    }

    fn record(&mut self, slot: usize, dma_id: u64) {
        self.last_dma_id[slot] = Some(dma_id);
    }
}

/// The DMA fd of one compressed input payload, queued on the input queue.
#[derive(Debug)]
struct InputBufferHandles {
    fd: Arc<File>,
    length: u64,
    offset: u32,
}

impl BufferHandles for InputBufferHandles {
    type SupportedMemoryType = MemoryType;

    fn len(&self) -> usize {
        1
    }

    fn fill_v4l2_plane(&self, _index: usize, plane: &mut v4l2_plane) {
        plane.m.fd = self.fd.as_raw_fd();
        plane.length = self.length as u32;
        plane.data_offset = self.offset;
    }
}

/// The plane fds of a graphic block, queued on the output queue.
#[derive(Debug)]
struct FrameHandles {
    planes: Vec<PlaneFd>,
}

impl FrameHandles {
    fn from_block(block: &GraphicBlock) -> Self {
        Self {
            planes: block.planes().to_vec(),
        }
    }
}

impl BufferHandles for FrameHandles {
    type SupportedMemoryType = MemoryType;

    fn len(&self) -> usize {
        self.planes.len()
    }

    fn fill_v4l2_plane(&self, index: usize, plane: &mut v4l2_plane) {
        let src = &self.planes[index];
        plane.m.fd = src.as_raw_fd();
        plane.length = src.size() as u32;
    }
}

type InputQueue = Queue<Output, BuffersAllocated<InputBufferHandles>>;
type OutputQueue = Queue<Capture, BuffersAllocated<FrameHandles>>;

/// An anonymous file of the given size, with a stable inode of its own.
/// Backs the initial EOS carrier, which only ever travels to the device and
/// back with an empty payload.
fn allocate_carrier_file(size: u64) -> std::io::Result<File> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let path = std::env::temp_dir().join(format!(
        "v4l2-codec2-eos-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)?;
    file.set_len(size)?;
    std::fs::remove_file(&path)?;
    Ok(file)
}

pub struct Decoder {
    weak_this: Weak<Mutex<Decoder>>,
    runner: TaskRunnerHandle,

    codec: VideoCodec,
    is_secure: bool,
    state: State,

    video_device: VideoDevice,
    poller: Option<DevicePoller>,

    input_queue: Option<InputQueue>,
    /// The input buffer size the driver settled on.
    input_buffer_size: usize,
    ring: BitstreamRing,

    output_queue: Option<OutputQueue>,
    output_streaming: bool,
    min_num_output_buffers: usize,
    coded_size: Resolution,
    visible_rect: Rect,

    get_pool_cb: GetPoolCb,
    output_cb: OutputCb,
    error_cb: Option<ErrorCb>,
    video_frame_pool: Option<SurfacePool>,

    decode_requests: VecDeque<DecodeRequest>,
    pending_decode_cbs: HashMap<i32, DecodeCb>,
    drain_cb: Option<DecodeCb>,

    /// Frames currently queued to the kernel, by V4L2 buffer index.
    frames_at_device: HashMap<usize, VideoFrame>,
    /// Stable block id -> V4L2 buffer index; fixed while the output queue is
    /// allocated.
    block_id_to_v4l2_id: HashMap<u32, usize>,
    /// Frames rescued from the device across a flush, to be requeued before
    /// asking the pool again.
    reuse_frame_queue: VecDeque<(u32, VideoFrame)>,

    /// Whether the initial EOS carrier is still in place (no resolution
    /// change seen yet).
    has_initial_eos_buffer: bool,
    /// Latched once the stream contained a decodable frame, meaning a
    /// resolution change is on its way.
    pending_drc: bool,
}

enum QueueFrameOutcome {
    Queued,
    DropAndRetry,
    Failed,
}

impl Decoder {
    /// Create and start a decoder. Must be called on the decoder task
    /// runner; `runner` must be a handle to it.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        codec: VideoCodec,
        input_buffer_size: usize,
        min_num_output_buffers: usize,
        get_pool_cb: GetPoolCb,
        output_cb: OutputCb,
        error_cb: ErrorCb,
        runner: TaskRunnerHandle,
        is_secure: bool,
    ) -> Result<Arc<Mutex<Decoder>>, DecoderError> {
        log::debug!(
            "creating decoder (codec={codec}, input_buffer_size={input_buffer_size}, \
             min_num_output_buffers={min_num_output_buffers})"
        );

        let video_device = VideoDevice::open_for_codec(codec)?;
        video_device.check_decoder_capabilities()?;
        video_device.probe_flush_support()?;
        video_device.subscribe_source_change()?;

        let decoder = Arc::new_cyclic(|weak| {
            Mutex::new(Decoder {
                weak_this: weak.clone(),
                runner,
                codec,
                is_secure,
                state: State::Idle,
                video_device,
                poller: None,
                input_queue: None,
                input_buffer_size: 0,
                ring: BitstreamRing::new(),
                output_queue: None,
                output_streaming: false,
                min_num_output_buffers,
                coded_size: Resolution::default(),
                visible_rect: Rect::default(),
                get_pool_cb,
                output_cb,
                error_cb: Some(error_cb),
                video_frame_pool: None,
                decode_requests: VecDeque::new(),
                pending_decode_cbs: HashMap::new(),
                drain_cb: None,
                frames_at_device: HashMap::new(),
                block_id_to_v4l2_id: HashMap::new(),
                reuse_frame_queue: VecDeque::new(),
                has_initial_eos_buffer: false,
                pending_drc: false,
            })
        });

        decoder.lock().unwrap().start(input_buffer_size)?;
        Ok(decoder)
    }

    fn start(&mut self, input_buffer_size: usize) -> Result<(), DecoderError> {
        self.setup_input_format(input_buffer_size)?;
        self.setup_initial_output()
            .map_err(DecoderError::InitialOutput)?;
        self.start_polling()
            .map_err(|e| DecoderError::InitialOutput(anyhow!("{e}")))?;
        Ok(())
    }

    fn setup_input_format(&mut self, input_buffer_size: usize) -> Result<(), DecoderError> {
        let input_pixel_format = crate::device::codec_to_pixel_format(self.codec);

        let supported = ioctl::FormatIterator::new(
            self.video_device.device().as_ref(),
            v4l2r::QueueType::VideoOutputMplane,
        )
        .any(|fmt| fmt.pixelformat == input_pixel_format);
        if !supported {
            return Err(DecoderError::UnsupportedCodec);
        }

        let mut queue = Queue::get_output_mplane_queue(self.video_device.device().clone())
            .map_err(DecoderError::CreateQueue)?;

        let format = queue
            .set_format(Format {
                width: 0,
                height: 0,
                pixelformat: input_pixel_format,
                plane_fmt: vec![PlaneLayout {
                    sizeimage: input_buffer_size as u32,
                    bytesperline: 0,
                }],
            })
            .map_err(DecoderError::SetInputFormat)?;
        self.input_buffer_size = format
            .plane_fmt
            .first()
            .map(|plane| plane.sizeimage as usize)
            .unwrap_or(input_buffer_size);
        log::debug!("input format: {format:?}");

        let queue = queue
            .request_buffers_generic::<InputBufferHandles>(
                MemoryType::DmaBuf,
                NUM_INPUT_BUFFERS as u32,
            )
            .map_err(DecoderError::RequestInputBuffers)?;
        queue.stream_on().map_err(DecoderError::StreamOnInput)?;

        self.input_queue = Some(queue);
        Ok(())
    }

    fn setup_initial_output(&mut self) -> anyhow::Result<()> {
        let mut queue = Queue::get_capture_mplane_queue(self.video_device.device().clone())
            .map_err(|e| anyhow!("failed to create the output queue: {e}"))?;
        self.setup_minimal_output_format(&mut queue)?;
        self.finish_output_queue_setup(queue, 1)?;

        // The initial EOS carrier guarantees the device can signal drain
        // completion before the first resolution change negotiates real
        // surfaces.
        let carrier_size = self.coded_size.area() as u64 * 3 / 2;
        let file = allocate_carrier_file(std::cmp::max(carrier_size, 4096))
            .context("failed to allocate the initial EOS carrier")?;
        let block = GraphicBlock::new(
            vec![PlaneFd::new(file)?],
            self.coded_size,
            HalPixelFormat::YCBCR_420_888,
            USAGE_VIDEO_DECODER,
            0,
            None,
        );
        let frame = VideoFrame::new_unpooled(block);

        let output_queue = self.output_queue.as_ref().expect("just allocated");
        let buffer = output_queue
            .try_get_free_buffer()
            .map_err(|e| anyhow!("failed to acquire the initial EOS buffer: {e}"))?;
        let index = buffer.index() as usize;
        buffer
            .queue_with_handles(FrameHandles::from_block(frame.block()))
            .map_err(|e| anyhow!("failed to queue the initial EOS buffer: {e}"))?;
        self.frames_at_device.insert(index, frame);
        self.has_initial_eos_buffer = true;

        Ok(())
    }

    /// Set the smallest output format the device supports, so the single
    /// carrier buffer stays cheap.
    fn setup_minimal_output_format(
        &self,
        queue: &mut Queue<Capture, QueueInit>,
    ) -> anyhow::Result<()> {
        for pixel_format in self.video_device.supported_capture_formats() {
            let min_resolution = self.video_device.min_supported_resolution(pixel_format);
            let applied = queue.set_format(Format {
                width: min_resolution.width,
                height: min_resolution.height,
                pixelformat: pixel_format,
                plane_fmt: vec![],
            });
            if applied.is_ok() {
                return Ok(());
            }
        }

        Err(anyhow!("failed to find a supported output pixel format"))
    }

    /// Size and start the output queue: read the device's post-negotiation
    /// format, allocate `max(driver minimum + extra, min_buffers_count)`
    /// DMABUF slots and stream on.
    fn finish_output_queue_setup(
        &mut self,
        mut queue: Queue<Capture, QueueInit>,
        min_buffers_count: usize,
    ) -> anyhow::Result<()> {
        let current: Format = queue
            .get_format()
            .map_err(|e| anyhow!("failed to get the output format: {e}"))?;
        let num_buffers = self
            .video_device
            .min_num_capture_buffers()
            .map(|min| min + NUM_EXTRA_OUTPUT_BUFFERS)
            .ok_or_else(|| anyhow!("failed to query the minimum buffer count"))?;
        let num_buffers = std::cmp::max(num_buffers, min_buffers_count);

        let coded_size = Resolution::new(current.width, current.height);
        let mut applied = None;
        for pixel_format in self.video_device.supported_capture_formats() {
            let format = queue.set_format(Format {
                width: coded_size.width,
                height: coded_size.height,
                pixelformat: pixel_format,
                plane_fmt: vec![],
            });
            if let Ok(format) = format {
                applied = Some(format);
                break;
            }
        }
        let format = applied.ok_or_else(|| anyhow!("failed to find a supported output format"))?;

        self.coded_size = Resolution::new(format.width, format.height);
        if self.coded_size.is_empty() {
            return Err(anyhow!("failed to get the resolution from the driver"));
        }
        self.visible_rect = self.video_device.visible_rect(self.coded_size);
        log::info!(
            "need {} output buffers, coded size: {}, visible rect: {}",
            num_buffers,
            self.coded_size,
            self.visible_rect
        );

        let queue = queue
            .request_buffers_generic::<FrameHandles>(MemoryType::DmaBuf, num_buffers as u32)
            .map_err(|e| anyhow!("failed to request output buffers: {e}"))?;
        if queue.num_buffers() == 0 {
            return Err(anyhow!("failed to allocate output buffers"));
        }
        log::debug!("allocated {} output buffers", queue.num_buffers());

        queue
            .stream_on()
            .map_err(|e| anyhow!("failed to stream on the output queue: {e}"))?;
        self.output_queue = Some(queue);
        self.output_streaming = true;

        Ok(())
    }

    fn start_polling(&mut self) -> Result<(), DeviceError> {
        let weak = self.weak_this.clone();
        let runner = self.runner.clone();
        let error_weak = self.weak_this.clone();
        let error_runner = self.runner.clone();

        let poller = DevicePoller::start(
            self.video_device.device().clone(),
            move |event_pending| {
                let weak = weak.clone();
                runner.post(move || {
                    if let Some(this) = weak.upgrade() {
                        this.lock().unwrap().on_service_device(event_pending);
                    }
                });
            },
            move || {
                error_runner.post(move || {
                    if let Some(this) = error_weak.upgrade() {
                        this.lock().unwrap().on_error();
                    }
                });
            },
        )?;
        self.poller = Some(poller);
        Ok(())
    }

    fn post_self(&self, task: impl FnOnce(&mut Decoder) + Send + 'static) {
        let weak = self.weak_this.clone();
        self.runner.post(move || {
            if let Some(this) = weak.upgrade() {
                task(&mut this.lock().unwrap());
            }
        });
    }

    fn schedule_poll(&self) {
        if let Some(poller) = &self.poller {
            poller.schedule_poll();
        }
    }

    /// Submit one compressed buffer. The callback fires when the kernel is
    /// done reading from it.
    pub fn decode(&mut self, buffer: BitstreamBuffer, cb: DecodeCb) {
        log::trace!("decode(id={})", buffer.id);

        if self.state == State::Error {
            log::error!("ignoring decode request in error state");
            self.runner.post(move || cb(DecodeStatus::Error));
            return;
        }

        if self.state == State::Idle {
            self.set_state(State::Decoding);
        }

        // Determining whether a resolution change is pending requires a look
        // at the payload, which secure buffers do not permit.
        if !self.is_secure && self.has_initial_eos_buffer && !self.pending_drc {
            self.pending_drc = self.wait_for_drc_possible(&buffer);
        }

        self.decode_requests.push_back(DecodeRequest {
            buffer: Some(buffer),
            cb,
        });
        self.pump_decode_requests();
    }

    fn wait_for_drc_possible(&self, buffer: &BitstreamBuffer) -> bool {
        let mut payload = vec![0u8; buffer.size as usize];
        if let Err(e) = buffer.dmabuf.read_exact_at(&mut payload, buffer.offset as u64) {
            log::warn!("failed to read bitstream {} for keyframe check: {e}", buffer.id);
            return false;
        }
        contains_keyframe(self.codec, &payload)
    }

    /// Finish decoding every submitted buffer, then call back. Draining an
    /// idle decoder completes immediately.
    pub fn drain(&mut self, cb: DecodeCb) {
        log::debug!("drain()");

        match self.state {
            State::Idle => {
                log::debug!("nothing to drain, ignore");
                self.runner.post(move || cb(DecodeStatus::Ok));
            }
            State::Decoding => {
                self.decode_requests.push_back(DecodeRequest { buffer: None, cb });
                self.pump_decode_requests();
            }
            State::Draining | State::Error => {
                log::error!("ignoring drain request in state {:?}", self.state);
                self.runner.post(move || cb(DecodeStatus::Error));
            }
        }
    }

    fn pump_decode_requests(&mut self) {
        if self.state != State::Decoding {
            return;
        }

        while let Some(request) = self.decode_requests.pop_front() {
            if request.buffer.is_none() {
                // A drain request. The stop command may only go out after
                // every input buffer is dequeued: the driver holds on to the
                // buffer that triggers a resolution change, and cannot decode
                // it until new output buffers arrive. Sending the stop
                // earlier would make the LAST output buffer overtake
                // undecoded input.
                let Some(input_queue) = self.input_queue.as_ref() else {
                    self.decode_requests.push_front(request);
                    self.on_error();
                    return;
                };
                if input_queue.num_queued_buffers() > 0 {
                    log::debug!("waiting for all input buffers to be dequeued");
                    self.decode_requests.push_front(request);
                    return;
                }

                // Without a streaming output queue the device cannot deliver
                // the EOS picture that ends the drain.
                if !self.output_streaming {
                    log::debug!("waiting for the output queue to start streaming");
                    self.decode_requests.push_front(request);
                    return;
                }

                // No decodable frame ever entered the device, so no EOS
                // picture will come back; the drain is already complete.
                if self.has_initial_eos_buffer && !self.pending_drc {
                    log::debug!("terminating drain, the stream held no frame");
                    let cb = request.cb;
                    self.runner.post(move || cb(DecodeStatus::Ok));
                    return;
                }

                if let Err(e) = self.video_device.send_stop_cmd() {
                    log::error!("failed to send the stop command: {e}");
                    (request.cb)(DecodeStatus::Error);
                    self.on_error();
                    return;
                }
                self.drain_cb = Some(request.cb);
                self.set_state(State::Draining);
                self.schedule_poll();
                return;
            }

            let buffer = request.buffer.as_ref().expect("checked above");
            let stat = match fstat(buffer.dmabuf.as_raw_fd()) {
                Ok(stat) => stat,
                Err(e) => {
                    log::error!("failed to stat the input dmabuf: {e}");
                    self.decode_requests.push_front(request);
                    self.on_error();
                    return;
                }
            };
            let dma_id = stat.st_ino;
            let plane_length = stat.st_size as u64;

            if buffer.size as usize > self.input_buffer_size {
                log::error!(
                    "input of {} bytes does not fit the {} byte input buffers",
                    buffer.size,
                    self.input_buffer_size
                );
                self.decode_requests.push_front(request);
                self.on_error();
                return;
            }

            let Some(input_queue) = self.input_queue.as_ref() else {
                self.decode_requests.push_front(request);
                self.on_error();
                return;
            };

            // Prefer the slot whose kernel mapping already covers this DMA
            // buffer; fall back to clobbering any free slot.
            let v4l2_buffer = self
                .ring
                .preferred_slot(dma_id)
                .and_then(|slot| input_queue.try_get_buffer(slot).ok())
                .or_else(|| input_queue.try_get_free_buffer().ok());
            let Some(v4l2_buffer) = v4l2_buffer else {
                log::debug!("no free input buffer, pausing");
                self.decode_requests.push_front(request);
                return;
            };

            let slot = v4l2_buffer.index() as usize;
            self.ring.record(slot, dma_id);

            let buffer = request.buffer.expect("checked above");
            let bitstream_id = buffer.id;
            log::trace!("queueing to input slot {slot}, bitstream_id={bitstream_id}");

            let handles = InputBufferHandles {
                fd: Arc::new(buffer.dmabuf),
                length: plane_length,
                offset: buffer.offset,
            };
            // The timestamp's seconds field carries the bitstream id; the
            // kernel echoes it on the decoded picture.
            let bytes_used = (buffer.offset + buffer.size) as usize;
            let queued = v4l2_buffer
                .set_timestamp(TimeVal::new(bitstream_id as i64, 0))
                .queue_with_handles(handles, &[bytes_used]);
            if let Err(e) = queued {
                log::error!("failed to queue the input buffer, bitstream_id={bitstream_id}: {e}");
                (request.cb)(DecodeStatus::Error);
                self.on_error();
                return;
            }

            self.pending_decode_cbs.insert(bitstream_id, request.cb);
            self.schedule_poll();
        }
    }

    /// Abort all in-flight work and return to Idle. Frames queued at the
    /// device are kept for reuse so their block <-> V4L2 slot mapping
    /// survives.
    pub fn flush(&mut self) {
        log::debug!("flush()");

        if self.state == State::Idle {
            log::debug!("nothing to flush, ignore");
            return;
        }
        if self.state == State::Error {
            log::error!("ignoring flush in error state");
            return;
        }

        for (_, cb) in self.pending_decode_cbs.drain() {
            cb(DecodeStatus::Aborted);
        }
        for request in self.decode_requests.drain(..) {
            (request.cb)(DecodeStatus::Aborted);
        }
        if let Some(cb) = self.drain_cb.take() {
            cb(DecodeStatus::Aborted);
        }

        // Stop polling while the queues bounce through streamoff.
        self.poller = None;

        let was_output_streaming = self.output_streaming;
        if let Some(queue) = self.output_queue.as_ref() {
            if self.output_streaming {
                if let Err(e) = queue.stream_off() {
                    log::error!("failed to stream off the output queue: {e}");
                    self.on_error();
                    return;
                }
                self.output_streaming = false;
            }
        }

        // Rescue the frames the device held. Returning them to the producer
        // is not reliable after a streamoff, and requeueing them directly
        // also keeps the block <-> V4L2 index mapping intact.
        for (v4l2_id, frame) in self.frames_at_device.drain() {
            let block_id = self
                .block_id_to_v4l2_id
                .iter()
                .find(|(_, id)| **id == v4l2_id)
                .map(|(block_id, _)| *block_id);
            match block_id {
                Some(block_id) => self.reuse_frame_queue.push_back((block_id, frame)),
                // The initial EOS carrier has no block mapping; let it go.
                None => drop(frame),
            }
        }

        let input_restarted: anyhow::Result<()> = (|| {
            if let Some(queue) = self.input_queue.as_ref() {
                queue.stream_off()?;
                queue.stream_on()?;
            }
            Ok(())
        })();
        if let Err(e) = input_restarted {
            log::error!("failed to restart the input queue: {e}");
            self.on_error();
            return;
        }
        if was_output_streaming {
            if let Some(queue) = self.output_queue.as_ref() {
                if let Err(e) = queue.stream_on() {
                    log::error!("failed to restart the output queue: {e}");
                    self.on_error();
                    return;
                }
                self.output_streaming = true;
            }
        }

        // Everything the output queue held was just dropped; the usual
        // fetch-on-dequeue trigger will not fire, so prime it here.
        if self.video_frame_pool.is_some() {
            self.try_fetch_video_frame();
        }

        if let Err(e) = self.start_polling() {
            log::error!("failed to restart polling: {e}");
            self.on_error();
            return;
        }

        self.set_state(State::Idle);
    }

    /// Runs on the decoder runner whenever the poller reports buffer or
    /// event progress.
    fn on_service_device(&mut self, event_pending: bool) {
        if self.state == State::Error {
            return;
        }

        // Input completions: hand the compressed buffers back.
        let mut input_dequeued = false;
        loop {
            let Some(input_queue) = self.input_queue.as_ref() else { break };
            match input_queue.try_dequeue() {
                Ok(dqbuf) => {
                    input_dequeued = true;
                    let bitstream_id = dqbuf.data.timestamp().tv_sec as i32;
                    log::trace!("input dequeue, bitstream_id={bitstream_id}");
                    match self.pending_decode_cbs.remove(&bitstream_id) {
                        Some(cb) => cb(DecodeStatus::Ok),
                        None => log::warn!("callback for {bitstream_id} already abandoned"),
                    }
                }
                Err(ioctl::DqBufError::IoctlError(
                    ioctl::DqBufIoctlError::NotReady | ioctl::DqBufIoctlError::Eos,
                )) => break,
                Err(e) => {
                    log::error!("failed to dequeue from the input queue: {e}");
                    self.on_error();
                    return;
                }
            }
        }

        // Output completions: route decoded pictures out.
        let mut output_dequeued = false;
        loop {
            let Some(output_queue) = self.output_queue.as_ref() else { break };
            if !self.output_streaming || output_queue.num_queued_buffers() == 0 {
                break;
            }
            let dqbuf = match output_queue.try_dequeue() {
                Ok(dqbuf) => dqbuf,
                Err(ioctl::DqBufError::IoctlError(
                    ioctl::DqBufIoctlError::NotReady | ioctl::DqBufIoctlError::Eos,
                )) => break,
                Err(e) => {
                    log::error!("failed to dequeue from the output queue: {e}");
                    self.on_error();
                    return;
                }
            };

            output_dequeued = true;
            let index = dqbuf.data.index() as usize;
            let bitstream_id = dqbuf.data.timestamp().tv_sec as i32;
            let bytes_used = *dqbuf.data.get_first_plane().bytesused;
            let is_last = dqbuf.data.is_last();
            log::trace!(
                "output dequeue, index={index}, bitstream_id={bitstream_id}, \
                 bytesused={bytes_used}, is_last={is_last}"
            );
            // Release the dequeued reference so the slot can be requeued.
            drop(dqbuf);

            let Some(mut frame) = self.frames_at_device.remove(&index) else {
                log::error!("V4L2 buffer {index} is not at the device");
                self.on_error();
                return;
            };

            if bytes_used > 0 {
                frame.set_bitstream_id(bitstream_id);
                frame.set_visible_rect(self.visible_rect);
                (self.output_cb)(frame);
            } else {
                // Workaround: unless this buffer is requeued before the next
                // drain finishes, the driver loses the EOS notification.
                // Matches the behavior of the kernel driver this pipeline
                // ships against; do not reorder.
                log::trace!("recycling empty buffer {index} back to the output queue");
                let requeued = self
                    .output_queue
                    .as_ref()
                    .ok_or_else(|| anyhow!("output queue disappeared"))
                    .and_then(|queue| {
                        queue
                            .try_get_buffer(index)
                            .map_err(|e| anyhow!("V4L2 output slot {index} is not free: {e}"))
                    })
                    .and_then(|buffer| {
                        buffer
                            .queue_with_handles(FrameHandles::from_block(frame.block()))
                            .map_err(|e| anyhow!("failed to recycle buffer {index}: {e}"))
                    });
                match requeued {
                    Ok(()) => {
                        self.frames_at_device.insert(index, frame);
                    }
                    Err(e) => {
                        log::error!("{e}");
                        self.on_error();
                        return;
                    }
                }
            }

            if is_last && self.drain_cb.is_some() {
                log::debug!("all buffers are drained");
                if let Err(e) = self.video_device.send_start_cmd() {
                    log::error!("failed to restart the decoder after drain: {e}");
                    self.on_error();
                    return;
                }
                if let Some(cb) = self.drain_cb.take() {
                    cb(DecodeStatus::Ok);
                }
                self.set_state(State::Idle);
            }
        }

        // The resolution change acts only once its event is dequeued; the
        // triggering input buffer is already inside the device by then.
        if event_pending && self.video_device.dequeue_resolution_change_event()
            && !self.change_resolution()
        {
            self.on_error();
            return;
        }

        if input_dequeued {
            self.post_self(|this| this.pump_decode_requests());
        }
        if output_dequeued {
            self.post_self(|this| this.try_fetch_video_frame());
        }

        // Keep watching the device while work is in flight.
        let queued = self
            .input_queue
            .as_ref()
            .map(|queue| queue.num_queued_buffers())
            .unwrap_or(0)
            + self
                .output_queue
                .as_ref()
                .map(|queue| queue.num_queued_buffers())
                .unwrap_or(0);
        if queued > 0 {
            self.schedule_poll();
        }
    }

    fn change_resolution(&mut self) -> bool {
        log::info!("resolution change event");

        self.has_initial_eos_buffer = false;

        if let Err(e) = self.restart_output_queue(self.min_num_output_buffers) {
            log::error!("failed to restart the output queue: {e:#}");
            return false;
        }

        // A drain stalled behind the resolution change can proceed now that
        // the output queue streams again.
        if matches!(self.decode_requests.front(), Some(request) if request.buffer.is_none()) {
            self.post_self(|this| this.pump_decode_requests());
        }

        // Only one pool may exist at a time; release the old one before
        // requesting its replacement.
        self.video_frame_pool = None;
        let num_buffers = self
            .output_queue
            .as_ref()
            .map(|queue| queue.num_buffers())
            .unwrap_or(0);
        self.video_frame_pool = (self.get_pool_cb)(
            self.coded_size,
            HalPixelFormat::YCBCR_420_888,
            num_buffers,
        );
        if self.video_frame_pool.is_none() {
            log::error!("failed to get a surface pool for size {}", self.coded_size);
            return false;
        }

        self.try_fetch_video_frame();
        true
    }

    /// Tear the output queue down and bring it back at the device's new
    /// coded size.
    fn restart_output_queue(&mut self, min_buffers_count: usize) -> anyhow::Result<()> {
        if let Some(queue) = self.output_queue.take() {
            if self.output_streaming {
                queue
                    .stream_off()
                    .map_err(|e| anyhow!("failed to stream off the output queue: {e}"))?;
            }
            self.output_streaming = false;
            // Dropping the allocated queue frees its buffers and releases
            // the queue for re-creation.
            drop(queue);
        }
        self.frames_at_device.clear();
        self.block_id_to_v4l2_id.clear();
        self.reuse_frame_queue.clear();

        let queue = Queue::get_capture_mplane_queue(self.video_device.device().clone())
            .map_err(|e| anyhow!("failed to re-create the output queue: {e}"))?;
        self.finish_output_queue_setup(queue, min_buffers_count)
    }

    /// Feed the output queue: reuse rescued frames first, then ask the pool.
    fn try_fetch_video_frame(&mut self) {
        if self.video_frame_pool.is_none() {
            log::error!("no surface pool; was the resolution change lost?");
            self.on_error();
            return;
        }

        let free_buffers = self
            .output_queue
            .as_ref()
            .map(|queue| queue.num_free_buffers())
            .unwrap_or(0);
        if free_buffers == 0 {
            log::trace!("no free output buffers, ignore");
            return;
        }

        if let Some((block_id, frame)) = self.reuse_frame_queue.pop_front() {
            // Posted rather than called to avoid unbounded recursion through
            // on_video_frame_ready.
            self.post_self(move |this| this.on_video_frame_ready(Some((frame, block_id))));
            return;
        }

        let weak = self.weak_this.clone();
        let armed = self
            .video_frame_pool
            .as_ref()
            .expect("checked above")
            .fetch(Box::new(move |result| {
                if let Some(this) = weak.upgrade() {
                    this.lock().unwrap().on_video_frame_ready(result);
                }
            }));
        if !armed {
            log::trace!("previous fetch callback still outstanding, ignore");
        }
    }

    /// A frame arrived from the pool (or the reuse queue); map it to its
    /// V4L2 slot and queue it.
    fn on_video_frame_ready(&mut self, frame_with_id: Option<FrameWithUniqueId>) {
        let Some((frame, block_id)) = frame_with_id else {
            log::error!("the surface pool failed to produce a frame");
            self.on_error();
            return;
        };

        match self.queue_frame_at_device(frame, block_id) {
            QueueFrameOutcome::Queued => {
                self.schedule_poll();
                self.try_fetch_video_frame();
            }
            QueueFrameOutcome::DropAndRetry => self.try_fetch_video_frame(),
            QueueFrameOutcome::Failed => self.on_error(),
        }
    }

    fn queue_frame_at_device(&mut self, frame: VideoFrame, block_id: u32) -> QueueFrameOutcome {
        let Some(output_queue) = self.output_queue.as_ref() else {
            log::error!("no output queue to feed");
            return QueueFrameOutcome::Failed;
        };

        let v4l2_id = match self.block_id_to_v4l2_id.get(&block_id) {
            Some(&v4l2_id) => {
                // A block seen before keeps its V4L2 buffer.
                v4l2_id
            }
            None if self.block_id_to_v4l2_id.len() < output_queue.num_buffers() => {
                // First sight of this block; hand it the next V4L2 buffer.
                let v4l2_id = self.block_id_to_v4l2_id.len();
                self.block_id_to_v4l2_id.insert(block_id, v4l2_id);
                v4l2_id
            }
            None => {
                // The pool must never hand out more distinct blocks than the
                // queue has buffers.
                log::error!("got more distinct blocks than V4L2 buffers");
                return QueueFrameOutcome::Failed;
            }
        };

        let buffer = match output_queue.try_get_buffer(v4l2_id) {
            Ok(buffer) => buffer,
            Err(e) => {
                // The consumer-side slot cache can hand the same buffer out
                // twice while it is still enqueued; dropping the duplicate is
                // safe as the pool keeps the allocation alive.
                log::warn!("block {block_id} supplied again while already enqueued: {e}");
                return QueueFrameOutcome::DropAndRetry;
            }
        };

        log::trace!("queueing frame, block_id={block_id}, v4l2_id={v4l2_id}");
        if self.frames_at_device.contains_key(&v4l2_id) {
            log::error!("V4L2 buffer {v4l2_id} is already enqueued");
            return QueueFrameOutcome::Failed;
        }
        if let Err(e) = buffer.queue_with_handles(FrameHandles::from_block(frame.block())) {
            log::error!("failed to queue frame to V4L2 buffer {v4l2_id}: {e}");
            return QueueFrameOutcome::Failed;
        }
        self.frames_at_device.insert(v4l2_id, frame);
        QueueFrameOutcome::Queued
    }

    fn on_error(&mut self) {
        if self.state == State::Error {
            return;
        }
        self.set_state(State::Error);
        if let Some(cb) = self.error_cb.take() {
            cb();
        }
    }

    fn set_state(&mut self, target: State) {
        if self.state == target {
            return;
        }
        let next = apply_transition(self.state, target);
        log::info!("set state {:?} => {:?}", self.state, next);
        self.state = next;
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        log::debug!("destroying decoder");

        // Stream off and free both queues, then stop polling, before the
        // device handle itself goes away.
        if let Some(queue) = self.output_queue.take() {
            if self.output_streaming {
                let _ = queue.stream_off();
            }
        }
        if let Some(queue) = self.input_queue.take() {
            let _ = queue.stream_off();
        }
        self.poller = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_runner::SerialTaskRunner;

    #[test]
    fn ring_prefers_matching_then_unused_slots() {
        let mut ring = BitstreamRing::new();
        // Never-used ring: first unused slot.
        assert_eq!(ring.preferred_slot(100), Some(0));
        ring.record(0, 100);

        // Matching entry wins.
        assert_eq!(ring.preferred_slot(100), Some(0));
        // Unknown id gets the next unused slot.
        assert_eq!(ring.preferred_slot(101), Some(1));
        ring.record(1, 101);

        // Clobbering a slot forgets the old identity.
        ring.record(1, 102);
        assert_eq!(ring.preferred_slot(102), Some(1));
        assert_eq!(ring.preferred_slot(101), Some(2));

        for slot in 2..NUM_INPUT_BUFFERS {
            ring.record(slot, 200 + slot as u64);
        }
        // Full ring with no match: nothing preferred.
        assert_eq!(ring.preferred_slot(999), None);
    }

    #[test]
    fn state_transitions_are_total() {
        use State::*;
        assert_eq!(apply_transition(Idle, Decoding), Decoding);
        assert_eq!(apply_transition(Decoding, Draining), Draining);
        assert_eq!(apply_transition(Decoding, Idle), Idle);
        assert_eq!(apply_transition(Draining, Idle), Idle);
        // Draining is only reachable from Decoding.
        assert_eq!(apply_transition(Idle, Draining), Error);
        assert_eq!(apply_transition(Draining, Draining), Draining);
        // Error is absorbing.
        assert_eq!(apply_transition(Error, Idle), Error);
        assert_eq!(apply_transition(Error, Decoding), Error);
    }

    #[ignore]
    // Ignore this test by default as it requires v4l2m2m-compatible hardware.
    #[test]
    fn test_decoder_starts_on_hardware() {
        let _ = env_logger::try_init();

        let runner = SerialTaskRunner::new("decoder").unwrap();
        let handle = runner.handle();
        let create_handle = handle.clone();

        let decoder = handle
            .post_and_wait(move || {
                Decoder::create(
                    VideoCodec::H264,
                    1024 * 1024,
                    8,
                    Box::new(|_, _, _| None),
                    Box::new(|_| ()),
                    Box::new(|| panic!("decoder reported an error")),
                    create_handle,
                    false,
                )
            })
            .unwrap()
            .expect("no usable H264 decoder found");

        handle.post_and_wait(move || drop(decoder)).unwrap();
    }
}
