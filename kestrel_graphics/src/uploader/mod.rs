//! Asynchronous resource uploads on a dedicated worker thread.
//!
//! Load commands go through an MPMC channel; the worker drains them in
//! batches, stages the data through a small ring of resource sets and
//! submits on a transfer-capable queue. Each set carries its own timeline
//! semaphore; the latest signal is published for the renderer to consume as
//! a `frame_end` wait.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
};

use anyhow::Result;
use ash::vk;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::{
    renderer::{frame::StagingArena, FRAME_OVERLAP},
    vulkan::{
        command::{CommandBuffer, CommandPool, PipelineBarrierBuilder},
        resource::{Image, ImageDescriptor},
        types::ResourceState,
        ContextShared, Queue, QueueSubmitSemaphoreDescriptor, Semaphore, SemaphoreKind,
        TimelineSignal,
    },
    Context,
};

pub mod promise;
pub mod reader;

pub use promise::{ImagePromise, UploadError};
pub use reader::{ImageBlockInfo, ImageReader, ImageReaderInfo, ReadBlock};

pub const UPLOADER_STAGING_ARENA_SIZE: u64 = 32 * 1024 * 1024;

const STAGING_ALIGNMENT: u64 = 16;

enum UploadCommand {
    Image {
        path: PathBuf,
        promise: Arc<ImagePromise>,
    },
}

/// One slot of the uploader ring: staging memory, a command buffer and the
/// timeline semaphore ordering this slot's submissions.
struct ResourceSet {
    staging: StagingArena,
    cmd: CommandBuffer,
    semaphore: Semaphore,
    counter: u64,
    first_submission: bool,
    recording: bool,
}

impl ResourceSet {
    fn new(context: &Arc<ContextShared>, cmd_pool: &CommandPool) -> Result<Self> {
        Ok(Self {
            staging: StagingArena::new(context.clone(), UPLOADER_STAGING_ARENA_SIZE)?,
            cmd: cmd_pool.allocate_command_buffer()?,
            semaphore: Semaphore::new(context.clone(), SemaphoreKind::Timeline, 0)?,
            counter: 0,
            first_submission: true,
            recording: false,
        })
    }

    /// Re-enters the slot. Waits for the slot's previous submission before
    /// reclaiming its staging memory, then opens the command buffer.
    fn begin(&mut self) -> Result<()> {
        if self.recording {
            return Ok(());
        }

        if self.counter > 0 {
            self.semaphore.wait_value(self.counter, u64::MAX)?;
        }
        self.staging.reset();

        self.cmd.reset()?;
        self.cmd.begin()?;
        self.cmd.begin_marker("upload");
        self.recording = true;

        Ok(())
    }

    fn end_and_submit(&mut self, queue: &Queue) -> Result<TimelineSignal> {
        self.cmd.end_marker();
        self.cmd.end()?;

        let wait_value = self.counter;
        self.counter += 1;
        let signal_value = wait_value + 1;

        let waits = if self.first_submission {
            Vec::new()
        } else {
            vec![QueueSubmitSemaphoreDescriptor {
                semaphore: self.semaphore.raw,
                stage_mask: vk::PipelineStageFlags2::COPY,
                value: wait_value,
            }]
        };
        let signals = [QueueSubmitSemaphoreDescriptor {
            semaphore: self.semaphore.raw,
            stage_mask: vk::PipelineStageFlags2::COPY,
            value: signal_value,
        }];

        queue.submit_command_buffers(&[self.cmd.raw], &waits, &signals, vk::Fence::null())?;

        self.first_submission = false;
        self.recording = false;

        Ok(TimelineSignal {
            semaphore: self.semaphore.raw,
            value: signal_value,
            stage: vk::PipelineStageFlags2::COPY,
        })
    }
}

struct WorkerState {
    context: Arc<ContextShared>,
    queue: Queue,
    _cmd_pool: CommandPool,
    sets: Vec<ResourceSet>,
    set_index: usize,
    receiver: Receiver<UploadCommand>,
    last_submitted: Arc<Mutex<Option<TimelineSignal>>>,
}

/// Owns the worker thread. Dropping the uploader closes the command channel,
/// joins the worker and idles the transfer queue.
pub struct Uploader {
    sender: Option<Sender<UploadCommand>>,
    worker: Option<JoinHandle<()>>,
    last_submitted: Arc<Mutex<Option<TimelineSignal>>>,
    queue: Queue,
}

impl Uploader {
    pub fn new(context: &Context, queue: Queue) -> Result<Self> {
        let shared = context.shared().clone();

        let cmd_pool = CommandPool::new(shared.clone(), &queue)?;
        let sets = (0..FRAME_OVERLAP)
            .map(|_| ResourceSet::new(&shared, &cmd_pool))
            .collect::<Result<Vec<_>>>()?;

        let (sender, receiver) = crossbeam_channel::unbounded();
        let last_submitted = Arc::new(Mutex::new(None));

        let state = WorkerState {
            context: shared,
            queue: queue.clone(),
            _cmd_pool: cmd_pool,
            sets,
            set_index: 0,
            receiver,
            last_submitted: last_submitted.clone(),
        };
        let worker = std::thread::Builder::new()
            .name("kestrel-uploader".into())
            .spawn(move || worker_loop(state))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            last_submitted,
            queue,
        })
    }

    /// Enqueues an image load. The returned promise resolves on the worker
    /// thread; poll `is_done` from the render loop.
    pub fn load_image(&self, path: impl AsRef<Path>) -> Arc<ImagePromise> {
        let promise = Arc::new(ImagePromise::new());

        let command = UploadCommand::Image {
            path: path.as_ref().to_path_buf(),
            promise: promise.clone(),
        };
        match &self.sender {
            Some(sender) if sender.send(command).is_ok() => {}
            _ => promise.fail(UploadError::Submission),
        }

        promise
    }

    /// Latest published timeline signal; pass it to `Renderer::frame_end` to
    /// order uploads before the frame.
    pub fn last_submitted_semaphore(&self) -> Option<TimelineSignal> {
        *self.last_submitted.lock()
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        // Closing the channel wakes the parked worker and ends its loop.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Uploader worker panicked");
            }
        }
        if let Err(error) = self.queue.wait_idle() {
            log::error!("Queue wait idle failed at uploader teardown: {}", error);
        }
    }
}

fn worker_loop(mut state: WorkerState) {
    loop {
        // Park until a command arrives; a closed channel ends the worker.
        let Ok(first) = state.receiver.recv() else {
            break;
        };
        let mut batch = vec![first];
        while let Ok(command) = state.receiver.try_recv() {
            batch.push(command);
        }

        let set_index = state.set_index % FRAME_OVERLAP;
        for command in batch {
            match command {
                UploadCommand::Image { path, promise } => {
                    match load_image_job(&state.context, &mut state.sets[set_index], &path) {
                        Ok(image) => promise.fulfill(image),
                        Err(error) => {
                            log::error!("Image upload failed for {}: {}", path.display(), error);
                            promise.fail(error);
                        }
                    }
                }
            }
        }

        let set = &mut state.sets[set_index];
        if set.recording {
            match set.end_and_submit(&state.queue) {
                Ok(signal) => {
                    *state.last_submitted.lock() = Some(signal);
                    state.set_index += 1;
                }
                Err(error) => {
                    log::error!("Upload submit failed: {}", error);
                }
            }
        }
    }
}

/// Reads an image file, creates the destination image, stages all blocks and
/// records the transfer. The image is handed back through the promise in
/// `TransferDst` state.
fn load_image_job(
    context: &Arc<ContextShared>,
    set: &mut ResourceSet,
    path: &Path,
) -> Result<Image, UploadError> {
    let mut reader = reader::open_image_reader(path)?;
    let info = reader.info().clone();

    let desc = ImageDescriptor {
        extent: info.extent,
        level_count: info.mip_levels,
        layer_count: info.array_layers,
        face_count: 1,
        usage_flags: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        format: info.format,
    };
    let image = Image::new(context.clone(), desc).map_err(|error| {
        log::error!("Failed to create destination image: {}", error);
        UploadError::ImageCreation
    })?;
    if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
        image.set_name(name);
    }

    set.begin().map_err(|error| {
        log::error!("Failed to begin upload command buffer: {}", error);
        UploadError::Submission
    })?;

    let mut builder = PipelineBarrierBuilder::default();
    builder.add_image(
        &image,
        ResourceState::Undefined,
        ResourceState::TransferDst,
        image.full_subresource_range(),
    );
    set.cmd.pipeline_barrier(&builder);

    let view = set
        .staging
        .allocate(context, info.whole_size, STAGING_ALIGNMENT)
        .map_err(|error| {
            log::error!("Failed to allocate upload staging memory: {}", error);
            UploadError::StagingAllocation
        })?;

    let staging_bytes = unsafe { view.bytes_mut() };
    let mut copy_regions = Vec::new();
    let mut cursor = 0u64;
    loop {
        match reader.read_next_block(staging_bytes, &mut cursor)? {
            ReadBlock::Block(block) => {
                copy_regions.push(
                    vk::BufferImageCopy2::default()
                        .buffer_offset(view.local_offset + block.write_offset)
                        .image_subresource(
                            vk::ImageSubresourceLayers::default()
                                .aspect_mask(vk::ImageAspectFlags::COLOR)
                                .mip_level(block.mip_level)
                                .base_array_layer(block.array_layer)
                                .layer_count(block.layer_count),
                        )
                        .image_extent(block.extent),
                );
            }
            ReadBlock::EndOfStream => break,
        }
    }

    set.cmd
        .copy_buffer_to_image(view.buffer, image.raw, &copy_regions);

    Ok(image)
}
