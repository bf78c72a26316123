use std::sync::Arc;

use anyhow::{Context as _, Result};
use ash::vk;

use crate::{
    handle::{FreeIndexAllocator, Handle, HandlePool},
    vulkan::{
        command::{CommandBuffer, CommandPool, PipelineBarrierBuilder},
        resource::{
            Buffer, BufferDescriptor, BufferView, DescriptorLayoutBuilder, DescriptorPool,
            DescriptorSet, DescriptorSetLayout, Image, ImageDescriptor, ImageView,
            PipelineLayout, PipelineLayoutBuilder, QueryPool, Sampler, SamplerDescriptor,
        },
        swapchain::{Swapchain, SwapchainDescriptor},
        types::ResourceState,
        ContextShared, Queue, QueueCaps, QueueSubmitSemaphoreDescriptor, TimelineSignal,
    },
    Context,
};

pub mod frame;
pub mod resource;
mod state;

use frame::{BufferUpdateInfo, ImageUpdateInfo, RendererFrame};
use resource::{QueuedDescriptorWrite, RenderResource, RenderResourceKind};
use state::PendingTranslations;

/// Number of frames that may be in flight on the GPU.
pub const FRAME_OVERLAP: usize = 2;

/// Upper bound of every bindless descriptor array, clamped further by the
/// adapter's per-stage limits at renderer construction.
pub const RENDERER_HANDLE_MAX: u32 = 65535;

const RENDERER_SAMPLER_SLOT: u32 = 0;
const RENDERER_SRV_SLOT: u32 = 1;
const RENDERER_UAV_SLOT: u32 = 2;

const ACQUIRE_TIMEOUT_NS: u64 = 1_000_000_000;

pub(crate) const BINDLESS_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::ALL_GRAPHICS.as_raw() | vk::ShaderStageFlags::COMPUTE.as_raw(),
);

pub struct RendererDescriptor {
    /// Queue used for all frame work. Must support graphics, compute,
    /// transfer and present.
    pub queue: Queue,
}

#[derive(Default)]
struct ImageBindings {
    srv_view: Option<ImageView>,
    srv_slot: Option<u32>,
    uav_views: Vec<ImageView>,
    uav_slots: Vec<u32>,
}

/// Owns the swapchain, the frame ring, the bindless descriptor set and the
/// table of handle-addressed render resources.
pub struct Renderer {
    context: Arc<ContextShared>,
    direct_queue: Queue,
    cmd_pool: CommandPool,

    frame_timestamp: QueryPool,
    timestamp_period: f64,
    gpu_delta_time: f64,

    descriptor_layout: DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    descriptor_set: DescriptorSet,
    pipeline_layout: PipelineLayout,

    swapchain: Swapchain,
    active_image_index: u32,
    outdated: bool,

    frames: Vec<RendererFrame>,
    active_frame: Option<usize>,
    frame_number: u64,

    resource_pool: HandlePool<RenderResource>,
    smp_alloc: FreeIndexAllocator,
    srv_alloc: FreeIndexAllocator,
    uav_alloc: FreeIndexAllocator,

    backbuffer_handle: Handle,

    pending_translations: PendingTranslations,
    queued_descriptor_writes: Vec<QueuedDescriptorWrite>,
}

impl Renderer {
    pub fn new(context: &Context, desc: RendererDescriptor) -> Result<Self> {
        let required = QueueCaps::GRAPHICS | QueueCaps::COMPUTE | QueueCaps::TRANSFER | QueueCaps::PRESENT;
        anyhow::ensure!(
            desc.queue.caps.contains(required),
            "Renderer queue must support graphics, compute, transfer and present"
        );

        let shared = context.shared().clone();
        let limits = shared.adapter_properties().limits;

        let cmd_pool = CommandPool::new(shared.clone(), &desc.queue)?;
        let frame_timestamp = QueryPool::new(shared.clone(), vk::QueryType::TIMESTAMP, 2)?;

        let handle_max = RENDERER_HANDLE_MAX
            .min(limits.max_per_stage_descriptor_samplers)
            .min(limits.max_per_stage_descriptor_sampled_images)
            .min(limits.max_per_stage_descriptor_storage_images);

        let mut layout_builder = DescriptorLayoutBuilder::default();
        layout_builder
            .add_binding(
                RENDERER_SAMPLER_SLOT,
                vk::DescriptorType::SAMPLER,
                handle_max,
                BINDLESS_STAGES,
            )
            .add_binding(
                RENDERER_SRV_SLOT,
                vk::DescriptorType::SAMPLED_IMAGE,
                handle_max,
                BINDLESS_STAGES,
            )
            .add_binding(
                RENDERER_UAV_SLOT,
                vk::DescriptorType::STORAGE_IMAGE,
                handle_max,
                BINDLESS_STAGES,
            );
        let descriptor_layout = DescriptorSetLayout::new(shared.clone(), &layout_builder)?;

        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLER)
                .descriptor_count(handle_max),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(handle_max),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(handle_max),
        ];
        let descriptor_pool = DescriptorPool::new(shared.clone(), &pool_sizes, 1)?;
        let descriptor_set =
            DescriptorSet::allocate(shared.clone(), &descriptor_pool, &descriptor_layout)?;

        let mut pipeline_layout_builder = PipelineLayoutBuilder::default();
        pipeline_layout_builder
            .add_layout(&descriptor_layout)
            .add_range(BINDLESS_STAGES, 0, limits.max_push_constants_size);
        let pipeline_layout = PipelineLayout::new(shared.clone(), &pipeline_layout_builder)?;

        let swapchain = Swapchain::new(shared.clone(), SwapchainDescriptor::default())?;

        let frames = (0..FRAME_OVERLAP)
            .map(|_| RendererFrame::new(&shared, &cmd_pool))
            .collect::<Result<Vec<_>>>()?;

        let mut resource_pool = HandlePool::new(handle_max as usize * 2);
        let smp_alloc = FreeIndexAllocator::new(handle_max);
        let mut srv_alloc = FreeIndexAllocator::new(handle_max);
        let uav_alloc = FreeIndexAllocator::new(handle_max);

        // The backbuffer keeps one stable SRV index; its image data is
        // patched to the acquired swapchain image every frame.
        let mut backbuffer = RenderResource::empty();
        backbuffer.srv_slot = srv_alloc.allocate();
        let backbuffer_handle = resource_pool.allocate(backbuffer);
        anyhow::ensure!(backbuffer_handle.is_valid(), "Resource pool exhausted");

        Ok(Self {
            context: shared,
            direct_queue: desc.queue,
            cmd_pool,
            frame_timestamp,
            timestamp_period: limits.timestamp_period as f64,
            gpu_delta_time: 0.0,
            descriptor_layout,
            descriptor_pool,
            descriptor_set,
            pipeline_layout,
            swapchain,
            active_image_index: 0,
            outdated: false,
            frames,
            active_frame: None,
            frame_number: 0,
            resource_pool,
            smp_alloc,
            srv_alloc,
            uav_alloc,
            backbuffer_handle,
            pending_translations: PendingTranslations::default(),
            queued_descriptor_writes: Vec::new(),
        })
    }

    pub fn backbuffer_handle(&self) -> Handle {
        self.backbuffer_handle
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// GPU time of the previous frame in milliseconds.
    pub fn gpu_delta_time(&self) -> f64 {
        self.gpu_delta_time
    }

    pub fn swapchain_format(&self) -> vk::Format {
        self.swapchain.surface_format.format
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn pipeline_layout(&self) -> &PipelineLayout {
        &self.pipeline_layout
    }

    pub fn context_shared(&self) -> &Arc<ContextShared> {
        &self.context
    }

    /// Primary command buffer of the frame being recorded.
    pub fn active_command_buffer(&self) -> Option<CommandBuffer> {
        let index = self.active_frame?;
        let frame = &self.frames[index];
        frame.is_recording.then(|| frame.cmd.clone())
    }

    pub fn add_resource(&mut self) -> Handle {
        self.resource_pool.allocate(RenderResource::empty())
    }

    pub fn get_resource(&self, handle: Handle) -> Option<&RenderResource> {
        self.resource_pool.get(handle)
    }

    pub fn create_image(
        &mut self,
        desc: ImageDescriptor,
        initial_state: ResourceState,
    ) -> Result<Handle> {
        let image = Image::new(self.context.clone(), desc)?;
        let handle = self.add_resource();
        anyhow::ensure!(handle.is_valid(), "Resource pool exhausted");

        if let Err(error) = self.attach_image(handle, image, initial_state) {
            self.resource_pool.free(handle);
            return Err(error);
        }
        Ok(handle)
    }

    pub fn create_buffer(&mut self, desc: BufferDescriptor) -> Result<Handle> {
        let buffer = Buffer::new(self.context.clone(), desc)?;
        let handle = self.add_resource();
        anyhow::ensure!(handle.is_valid(), "Resource pool exhausted");

        self.attach_buffer(handle, buffer)?;
        Ok(handle)
    }

    pub fn create_sampler(&mut self, desc: SamplerDescriptor) -> Result<Handle> {
        let sampler = Sampler::new(self.context.clone(), desc)?;
        let handle = self.add_resource();
        anyhow::ensure!(handle.is_valid(), "Resource pool exhausted");

        if let Err(error) = self.attach_sampler(handle, sampler) {
            self.resource_pool.free(handle);
            return Err(error);
        }
        Ok(handle)
    }

    /// Installs an image into a resource slot: creates the SRV/UAV views
    /// demanded by the image's usage, assigns bindless slots and queues the
    /// matching descriptor writes.
    pub fn attach_image(
        &mut self,
        handle: Handle,
        image: Image,
        initial_state: ResourceState,
    ) -> Result<()> {
        anyhow::ensure!(self.resource_pool.is_valid(handle), "Stale resource handle");

        let bindings = self.create_image_bindings(&image)?;

        if let (Some(slot), Some(view)) = (bindings.srv_slot, bindings.srv_view.as_ref()) {
            self.queued_descriptor_writes
                .push(QueuedDescriptorWrite::SampledImage {
                    slot,
                    view: view.raw,
                });
        }
        for (slot, view) in bindings.uav_slots.iter().zip(bindings.uav_views.iter()) {
            self.queued_descriptor_writes
                .push(QueuedDescriptorWrite::StorageImage {
                    slot: *slot,
                    view: view.raw,
                });
        }

        let resource = self
            .resource_pool
            .get_mut(handle)
            .context("Stale resource handle")?;
        resource.kind = RenderResourceKind::Image {
            image,
            srv_view: bindings.srv_view,
            uav_views: bindings.uav_views,
        };
        resource.state = initial_state;
        resource.srv_slot = bindings.srv_slot;
        resource.uav_slots = bindings.uav_slots;

        Ok(())
    }

    fn create_image_bindings(&mut self, image: &Image) -> Result<ImageBindings> {
        let mut bindings = ImageBindings::default();
        if let Err(error) = self.try_create_image_bindings(image, &mut bindings) {
            for slot in bindings.uav_slots.drain(..) {
                self.uav_alloc.free(slot);
            }
            if let Some(slot) = bindings.srv_slot.take() {
                self.srv_alloc.free(slot);
            }
            return Err(error);
        }
        Ok(bindings)
    }

    fn try_create_image_bindings(
        &mut self,
        image: &Image,
        bindings: &mut ImageBindings,
    ) -> Result<()> {
        if image.usage_flags.contains(vk::ImageUsageFlags::SAMPLED) {
            let view = ImageView::new(
                self.context.clone(),
                image,
                image.full_subresource_range(),
            )?;
            let slot = self.srv_alloc.allocate().context("Out of SRV slots")?;
            bindings.srv_view = Some(view);
            bindings.srv_slot = Some(slot);
        }

        if image.usage_flags.contains(vk::ImageUsageFlags::STORAGE) {
            for mip in 0..image.level_count {
                let mut range = image.full_subresource_range();
                range.base_mip_level = mip;
                range.level_count = 1;

                let view = ImageView::new(self.context.clone(), image, range)?;
                let slot = self.uav_alloc.allocate().context("Out of UAV slots")?;
                bindings.uav_views.push(view);
                bindings.uav_slots.push(slot);
            }
        }

        Ok(())
    }

    pub fn attach_buffer(&mut self, handle: Handle, buffer: Buffer) -> Result<()> {
        let resource = self
            .resource_pool
            .get_mut(handle)
            .context("Stale resource handle")?;
        resource.kind = RenderResourceKind::Buffer { buffer };
        resource.state = ResourceState::Undefined;
        Ok(())
    }

    pub fn attach_sampler(&mut self, handle: Handle, sampler: Sampler) -> Result<()> {
        anyhow::ensure!(self.resource_pool.is_valid(handle), "Stale resource handle");

        let slot = self.smp_alloc.allocate().context("Out of sampler slots")?;
        self.queued_descriptor_writes
            .push(QueuedDescriptorWrite::Sampler {
                slot,
                sampler: sampler.raw,
            });

        let resource = self
            .resource_pool
            .get_mut(handle)
            .context("Stale resource handle")?;
        resource.kind = RenderResourceKind::Sampler { sampler };
        resource.srv_slot = Some(slot);
        Ok(())
    }

    /// Swaps in a replacement image. The previous contents live until the
    /// frame that scheduled the swap has retired; the returned handle
    /// supersedes the old one.
    pub fn update_image(
        &mut self,
        handle: Handle,
        image: Image,
        initial_state: ResourceState,
    ) -> Result<Handle> {
        let (previous, new_handle) = self
            .resource_pool
            .replace(handle, RenderResource::empty())
            .context("Stale resource handle")?;
        self.defer_destroy(previous);

        self.attach_image(new_handle, image, initial_state)?;
        Ok(new_handle)
    }

    pub fn update_buffer(&mut self, handle: Handle, buffer: Buffer) -> Result<Handle> {
        let (previous, new_handle) = self
            .resource_pool
            .replace(handle, RenderResource::empty())
            .context("Stale resource handle")?;
        self.defer_destroy(previous);

        self.attach_buffer(new_handle, buffer)?;
        Ok(new_handle)
    }

    pub fn update_sampler(&mut self, handle: Handle, sampler: Sampler) -> Result<Handle> {
        let (previous, new_handle) = self
            .resource_pool
            .replace(handle, RenderResource::empty())
            .context("Stale resource handle")?;
        self.defer_destroy(previous);

        self.attach_sampler(new_handle, sampler)?;
        Ok(new_handle)
    }

    /// Invalidates the handle. The underlying GPU objects are destroyed once
    /// every frame that could reference them has retired.
    pub fn free_resource(&mut self, handle: Handle) {
        if let Some(resource) = self.resource_pool.free(handle) {
            self.defer_destroy(resource);
        }
    }

    fn defer_destroy(&mut self, resource: RenderResource) {
        if let Some(index) = self.active_frame {
            self.frames[index].pending_destroys.push(resource);
        } else if self.frame_number == 0 {
            // Nothing was ever submitted; safe to release right away.
            self.release_snapshot(resource);
        } else {
            // Outside a frame, park on the most recently submitted slot: its
            // fence fires last, after every possible reference.
            let index = ((self.frame_number - 1) % FRAME_OVERLAP as u64) as usize;
            self.frames[index].pending_destroys.push(resource);
        }
    }

    /// Returns the resource's bindless slots and drops it, which parks the
    /// GPU objects in the context's destruction hub.
    fn release_snapshot(&mut self, resource: RenderResource) {
        match &resource.kind {
            RenderResourceKind::Sampler { .. } => {
                if let Some(slot) = resource.srv_slot {
                    self.smp_alloc.free(slot);
                }
            }
            RenderResourceKind::Image { .. } | RenderResourceKind::Empty => {
                if let Some(slot) = resource.srv_slot {
                    self.srv_alloc.free(slot);
                }
                for slot in &resource.uav_slots {
                    self.uav_alloc.free(*slot);
                }
            }
            RenderResourceKind::Buffer { .. } => {}
        }
    }

    fn flush_frame_destroys(&mut self, frame_index: usize) {
        let pending = std::mem::take(&mut self.frames[frame_index].pending_destroys);
        for resource in pending {
            self.release_snapshot(resource);
        }
    }

    /// Schedules a logical transition for the next `translate_states` call.
    /// Repeated calls for the same handle collapse; the latest state wins.
    pub fn add_state_translation(&mut self, handle: Handle, new_state: ResourceState) {
        if !self.resource_pool.is_valid(handle) {
            return;
        }
        if !self.pending_translations.add(handle, new_state) {
            log::warn!("State translation list is full, transition dropped");
        }
    }

    /// Compiles every pending transition into one batched pipeline barrier
    /// on `cmd` and commits the new states to the resource table.
    pub fn translate_states(&mut self, cmd: &CommandBuffer) {
        let pool = &self.resource_pool;
        let resolved = self
            .pending_translations
            .resolve(|handle| pool.get(handle).map(|resource| resource.state));
        if resolved.is_empty() {
            return;
        }

        let mut builder = PipelineBarrierBuilder::default();
        for translation in &resolved {
            let Some(resource) = self.resource_pool.get(translation.handle) else {
                continue;
            };
            match &resource.kind {
                RenderResourceKind::Image { image, .. } => {
                    builder.add_image(
                        image,
                        translation.old_state,
                        translation.new_state,
                        image.full_subresource_range(),
                    );
                }
                RenderResourceKind::Buffer { buffer } => {
                    builder.add_buffer(
                        buffer,
                        translation.old_state,
                        translation.new_state,
                        0,
                        vk::WHOLE_SIZE,
                    );
                }
                RenderResourceKind::Empty | RenderResourceKind::Sampler { .. } => continue,
            }
        }

        cmd.pipeline_barrier(&builder);

        for translation in &resolved {
            if let Some(resource) = self.resource_pool.get_mut(translation.handle) {
                resource.state = translation.new_state;
            }
        }
    }

    /// Starts the next frame: recreates an outdated swapchain, retires the
    /// frame slot, flushes its deferred destroys and acquires the next
    /// swapchain image. Returns false when the frame must be skipped.
    pub fn frame_begin(&mut self) -> Result<bool> {
        if self.outdated || self.swapchain.is_outdated() {
            self.direct_queue.wait_idle()?;
            self.swapchain.recreate()?;
            self.active_frame = None;
            self.active_image_index = 0;
            self.outdated = false;
        }

        let frame_index = (self.frame_number % FRAME_OVERLAP as u64) as usize;
        if !self.frames[frame_index].begin()? {
            return Ok(false);
        }

        self.flush_frame_destroys(frame_index);
        self.context.drain_destruction();

        let acquired_semaphore = self.frames[frame_index].image_available.raw;
        match self
            .swapchain
            .acquire_next_image(ACQUIRE_TIMEOUT_NS, acquired_semaphore)
        {
            Ok((image_index, false)) => {
                self.active_image_index = image_index;
            }
            // A suboptimal acquire counts as a failure: skip the frame and
            // recreate before the next one.
            Ok((_, true)) | Err(_) => {
                log::warn!("Swapchain image acquire failed, skipping frame");
                self.outdated = true;
                self.frames[frame_index].is_recording = false;
                return Ok(false);
            }
        }

        self.patch_backbuffer();

        if self.frame_number > 0 {
            let mut timestamps = [0u64; 2];
            if self.frame_timestamp.get_results(0, &mut timestamps).is_ok() {
                let elapsed = timestamps[1].saturating_sub(timestamps[0]);
                self.gpu_delta_time = elapsed as f64 * self.timestamp_period / 1_000_000.0;
            }
        }

        let cmd = self.frames[frame_index].cmd.clone();
        cmd.reset_query(&self.frame_timestamp, 0, 2);
        cmd.write_timestamp(&self.frame_timestamp, vk::PipelineStageFlags2::TOP_OF_PIPE, 0);
        cmd.bind_descriptor_set(
            &self.pipeline_layout,
            &self.descriptor_set,
            vk::PipelineBindPoint::GRAPHICS,
        );
        cmd.bind_descriptor_set(
            &self.pipeline_layout,
            &self.descriptor_set,
            vk::PipelineBindPoint::COMPUTE,
        );

        self.active_frame = Some(frame_index);

        Ok(true)
    }

    /// Points the backbuffer resource at the acquired swapchain image. The
    /// pre-allocated SRV index stays as is; no descriptor writes happen.
    fn patch_backbuffer(&mut self) {
        let index = self.active_image_index as usize;
        let image = Image::from_swapchain(
            self.context.clone(),
            self.swapchain.image_raw(index),
            self.swapchain.surface_format.format,
            self.swapchain.extent,
        );
        let view = ImageView::from_raw(self.context.clone(), self.swapchain.image_view_raw(index));

        if let Some(resource) = self.resource_pool.get_mut(self.backbuffer_handle) {
            resource.kind = RenderResourceKind::Image {
                image,
                srv_view: Some(view),
                uav_views: Vec::new(),
            };
            // Swapchain images come back undefined after an acquire.
            resource.state = ResourceState::Undefined;
        }
    }

    /// Ends and submits the frame, waiting on the acquire semaphore and the
    /// uploader's timeline signal when one is supplied, then presents.
    pub fn frame_end(&mut self, uploader_semaphore: Option<TimelineSignal>) -> Result<bool> {
        let Some(frame_index) = self.active_frame else {
            return Ok(false);
        };
        if !self.frames[frame_index].is_recording {
            return Ok(false);
        }

        let cmd = self.frames[frame_index].cmd.clone();

        self.add_state_translation(self.backbuffer_handle, ResourceState::Present);
        self.translate_states(&cmd);

        self.flush_descriptor_writes();

        cmd.write_timestamp(&self.frame_timestamp, vk::PipelineStageFlags2::TOP_OF_PIPE, 1);
        cmd.end()?;

        let frame = &self.frames[frame_index];
        let mut wait_semaphores = vec![QueueSubmitSemaphoreDescriptor {
            semaphore: frame.image_available.raw,
            stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            value: 0,
        }];
        if let Some(signal) = uploader_semaphore {
            wait_semaphores.push(QueueSubmitSemaphoreDescriptor {
                semaphore: signal.semaphore,
                stage_mask: signal.stage,
                value: signal.value,
            });
        }
        let signal_semaphores = [QueueSubmitSemaphoreDescriptor {
            semaphore: frame.rendering_finished.raw,
            stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            value: 0,
        }];

        if let Err(error) = self.direct_queue.submit_command_buffers(
            &[cmd.raw],
            &wait_semaphores,
            &signal_semaphores,
            frame.fence.raw,
        ) {
            log::error!("Frame submit failed: {}", error);
            self.frames[frame_index].is_recording = false;
            self.active_frame = None;
            return Ok(false);
        }
        self.frames[frame_index].submitted = true;

        let rendering_finished = self.frames[frame_index].rendering_finished.raw;
        match self
            .swapchain
            .queue_present(&self.direct_queue, &[rendering_finished])
        {
            Ok(_suboptimal) => {}
            Err(error) => {
                log::warn!("Swapchain present failed: {}", error);
                self.outdated = true;
                self.frames[frame_index].is_recording = false;
                self.active_frame = None;
                return Ok(false);
            }
        }

        self.frames[frame_index].is_recording = false;
        self.active_frame = None;
        self.frame_number += 1;

        Ok(true)
    }

    /// Byte-writable staging span from the active frame's arena, valid until
    /// the frame retires.
    pub fn try_allocate_staging_memory(
        &mut self,
        required_size: u64,
        required_alignment: u64,
    ) -> Result<BufferView> {
        let context = self.context.clone();
        let frame = self.active_frame_mut()?;
        frame.try_allocate_staging_memory(&context, required_size, required_alignment)
    }

    /// Emits the accumulated buffer copy regions on the active frame.
    pub fn buffer_update_end(&mut self, update: BufferUpdateInfo) -> Result<()> {
        let cmd = self
            .active_command_buffer()
            .context("No frame is recording")?;
        cmd.copy_buffer(update.view.buffer, update.dst_buffer, &update.copy_regions);
        Ok(())
    }

    /// Emits the accumulated buffer-to-image copy regions on the active
    /// frame.
    pub fn image_update_end(&mut self, update: ImageUpdateInfo) -> Result<()> {
        let cmd = self
            .active_command_buffer()
            .context("No frame is recording")?;
        cmd.copy_buffer_to_image(update.view.buffer, update.dst_image, &update.copy_regions);
        Ok(())
    }

    pub fn push_constants<T: bytemuck::Pod>(
        &self,
        stage_flags: vk::ShaderStageFlags,
        data: &T,
    ) -> Result<()> {
        let cmd = self
            .active_command_buffer()
            .context("No frame is recording")?;
        cmd.push_constants(&self.pipeline_layout, stage_flags, 0, bytemuck::bytes_of(data));
        Ok(())
    }

    fn active_frame_mut(&mut self) -> Result<&mut RendererFrame> {
        let index = self.active_frame.context("No frame is recording")?;
        Ok(&mut self.frames[index])
    }

    fn flush_descriptor_writes(&mut self) {
        if self.queued_descriptor_writes.is_empty() {
            return;
        }

        let queued = std::mem::take(&mut self.queued_descriptor_writes);
        let image_infos = queued
            .iter()
            .map(|write| match write {
                QueuedDescriptorWrite::Sampler { sampler, .. } => {
                    vk::DescriptorImageInfo::default().sampler(*sampler)
                }
                QueuedDescriptorWrite::SampledImage { view, .. } => {
                    vk::DescriptorImageInfo::default()
                        .image_view(*view)
                        .image_layout(vk::ImageLayout::READ_ONLY_OPTIMAL)
                }
                QueuedDescriptorWrite::StorageImage { view, .. } => {
                    vk::DescriptorImageInfo::default()
                        .image_view(*view)
                        .image_layout(vk::ImageLayout::GENERAL)
                }
            })
            .collect::<Vec<_>>();

        let descriptor_writes = queued
            .iter()
            .zip(image_infos.iter())
            .map(|(write, info)| {
                let (binding, slot, descriptor_type) = match write {
                    QueuedDescriptorWrite::Sampler { slot, .. } => {
                        (RENDERER_SAMPLER_SLOT, *slot, vk::DescriptorType::SAMPLER)
                    }
                    QueuedDescriptorWrite::SampledImage { slot, .. } => {
                        (RENDERER_SRV_SLOT, *slot, vk::DescriptorType::SAMPLED_IMAGE)
                    }
                    QueuedDescriptorWrite::StorageImage { slot, .. } => {
                        (RENDERER_UAV_SLOT, *slot, vk::DescriptorType::STORAGE_IMAGE)
                    }
                };
                vk::WriteDescriptorSet::default()
                    .dst_set(self.descriptor_set.raw)
                    .dst_binding(binding)
                    .dst_array_element(slot)
                    .descriptor_type(descriptor_type)
                    .image_info(std::slice::from_ref(info))
            })
            .collect::<Vec<_>>();

        unsafe {
            self.context
                .raw
                .update_descriptor_sets(&descriptor_writes, &[]);
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(error) = self.direct_queue.wait_idle() {
            log::error!("Queue wait idle failed at renderer teardown: {}", error);
        }

        for frame_index in 0..self.frames.len() {
            self.flush_frame_destroys(frame_index);
        }

        let live_handles = self
            .resource_pool
            .iter()
            .map(|(handle, _)| handle)
            .collect::<Vec<_>>();
        for handle in live_handles {
            if let Some(resource) = self.resource_pool.free(handle) {
                self.release_snapshot(resource);
            }
        }

        // Dropping the frames parks their staging buffers in the hub so the
        // drain below reclaims them too.
        self.frames.clear();
        self.context.drain_destruction();
    }
}
