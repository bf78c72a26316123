use std::{ffi::CString, io::Cursor, path::Path, sync::Arc};

use anyhow::{Context as _, Result};
use ash::vk;
use bitflags::bitflags;
use gpu_allocator::{
    vulkan::{AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};

use super::{
    impl_set_name,
    types::{format_aspect_mask, image_view_type},
    ContextShared, PendingDestructionBuffer, PendingDestructionImage,
};

bitflags! {
    /// High-level buffer usage. Translated into Vulkan usage flags and a
    /// memory location at creation time.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct BufferFlags: u32 {
        const UNIFORM = 1 << 0;
        const STORAGE = 1 << 1;
        const VERTEX = 1 << 2;
        const INDEX = 1 << 3;
        const INDIRECT = 1 << 4;
        const STAGING = 1 << 5;
        const READBACK = 1 << 6;
        const DYNAMIC = 1 << 7;
        const DEVICE_ADDRESS = 1 << 8;
        const ACCELERATION_BUILD = 1 << 9;
        const ACCELERATION_STORE = 1 << 10;
        const SHADER_BINDING_TABLE = 1 << 11;
    }
}

impl BufferFlags {
    fn usage_flags(self) -> vk::BufferUsageFlags {
        let mut usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        if self.contains(Self::UNIFORM) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(Self::STORAGE) {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(Self::VERTEX) {
            usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDEX) {
            usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::INDIRECT) {
            usage |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        if self.contains(Self::DEVICE_ADDRESS) {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        if self.contains(Self::ACCELERATION_BUILD) {
            usage |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        }
        if self.contains(Self::ACCELERATION_STORE) {
            usage |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
        }
        if self.contains(Self::SHADER_BINDING_TABLE) {
            usage |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
        }
        usage
    }

    fn memory_location(self) -> MemoryLocation {
        if self.intersects(Self::STAGING | Self::DYNAMIC) {
            MemoryLocation::CpuToGpu
        } else if self.contains(Self::READBACK) {
            MemoryLocation::GpuToCpu
        } else {
            MemoryLocation::GpuOnly
        }
    }
}

pub struct BufferDescriptor {
    pub size: u64,
    pub alignment: u64,
    pub flags: BufferFlags,
}

impl BufferDescriptor {
    pub fn new(size: u64, flags: BufferFlags) -> Self {
        Self {
            size,
            alignment: 1,
            flags,
        }
    }

    pub fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }
}

pub struct Buffer {
    pub(crate) raw: vk::Buffer,
    allocation: Option<gpu_allocator::vulkan::Allocation>,
    pub size: u64,
    pub flags: BufferFlags,
    pub device_address: Option<vk::DeviceAddress>,
    context: Arc<ContextShared>,
}

impl Buffer {
    pub fn new(context: Arc<ContextShared>, desc: BufferDescriptor) -> Result<Self> {
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.flags.usage_flags());

        let raw;
        let mut requirements;
        unsafe {
            raw = context.raw.create_buffer(&create_info, None)?;
            requirements = context.raw.get_buffer_memory_requirements(raw);
        }
        requirements.alignment = requirements.alignment.max(desc.alignment);

        let allocation = context.allocator.lock().allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location: desc.flags.memory_location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            context
                .raw
                .bind_buffer_memory(raw, allocation.memory(), allocation.offset())?;
        }

        let device_address = desc.flags.contains(BufferFlags::DEVICE_ADDRESS).then(|| {
            let info = vk::BufferDeviceAddressInfo::default().buffer(raw);
            unsafe { context.raw.get_buffer_device_address(&info) }
        });

        Ok(Self {
            raw,
            allocation: Some(allocation),
            size: desc.size,
            flags: desc.flags,
            device_address,
            context,
        })
    }

    fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
            .map(|ptr| ptr.as_ptr() as *mut u8)
    }

    /// Host-visible window into the buffer. Returns `None` when the memory
    /// is not mapped or the range is out of bounds.
    pub fn view(&self, local_offset: u64, size: u64) -> Option<BufferView> {
        if local_offset + size > self.size {
            return None;
        }
        let mapped = self.mapped_ptr()?;

        Some(BufferView {
            buffer: self.raw,
            mapped,
            local_offset,
            size,
        })
    }

    /// Writes raw bytes at a byte offset. The buffer must be host-visible.
    pub fn write_data(&self, data: &[u8], offset: u64) -> Result<()> {
        let mapped = self
            .mapped_ptr()
            .context("Buffer memory is not host-visible")?;
        anyhow::ensure!(
            offset + data.len() as u64 <= self.size,
            "Buffer write of {} bytes at {} exceeds size {}",
            data.len(),
            offset,
            self.size
        );

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapped.add(offset as usize),
                data.len(),
            );
        }

        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.context
                .schedule_destruction_buffer(PendingDestructionBuffer {
                    raw: self.raw,
                    allocation,
                });
        }
    }
}

impl_set_name!(Buffer);

/// Span of a host-visible buffer handed out by a staging arena. The view is
/// writable for the lifetime of the frame/slot that produced it.
#[derive(Clone, Copy)]
pub struct BufferView {
    pub(crate) buffer: vk::Buffer,
    mapped: *mut u8,
    pub local_offset: u64,
    pub size: u64,
}

impl BufferView {
    /// Copies bytes into the view at a view-relative offset. Fails when the
    /// write would overrun the view.
    pub fn write(&self, data: &[u8], offset: u64) -> bool {
        if offset + data.len() as u64 > self.size {
            return false;
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.mapped.add((self.local_offset + offset) as usize),
                data.len(),
            );
        }
        true
    }

    pub(crate) unsafe fn bytes_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(
            self.mapped.add(self.local_offset as usize),
            self.size as usize,
        )
    }

    #[cfg(test)]
    pub(crate) fn for_tests(backing: &mut [u8], local_offset: u64) -> Self {
        Self {
            buffer: vk::Buffer::null(),
            mapped: backing.as_mut_ptr(),
            local_offset,
            size: backing.len() as u64 - local_offset,
        }
    }
}

pub struct ImageDescriptor {
    pub extent: vk::Extent3D,
    pub level_count: u32,
    pub layer_count: u32,
    pub face_count: u32,
    pub usage_flags: vk::ImageUsageFlags,
    pub format: vk::Format,
}

impl ImageDescriptor {
    pub fn new_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            level_count: 1,
            layer_count: 1,
            face_count: 1,
            usage_flags: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            format,
        }
    }

    pub fn usage(mut self, usage_flags: vk::ImageUsageFlags) -> Self {
        self.usage_flags = usage_flags;
        self
    }

    pub fn levels(mut self, level_count: u32) -> Self {
        self.level_count = level_count;
        self
    }

    pub fn layers(mut self, layer_count: u32) -> Self {
        self.layer_count = layer_count;
        self
    }
}

pub struct Image {
    pub(crate) raw: vk::Image,
    allocation: Option<gpu_allocator::vulkan::Allocation>,
    pub extent: vk::Extent3D,
    pub level_count: u32,
    pub layer_count: u32,
    pub face_count: u32,
    pub usage_flags: vk::ImageUsageFlags,
    pub format: vk::Format,
    /// Swapchain-backed images do not own their handle or memory.
    swapchain_backed: bool,
    context: Arc<ContextShared>,
}

impl Image {
    pub fn new(context: Arc<ContextShared>, desc: ImageDescriptor) -> Result<Self> {
        let image_type = if desc.extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else if desc.extent.height > 1 {
            vk::ImageType::TYPE_2D
        } else {
            vk::ImageType::TYPE_1D
        };

        let mut create_flags = vk::ImageCreateFlags::empty();
        if desc.face_count == 6 {
            create_flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }

        let create_info = vk::ImageCreateInfo::default()
            .flags(create_flags)
            .image_type(image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.level_count)
            .array_layers(desc.layer_count * desc.face_count)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage_flags | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { context.raw.create_image(&create_info, None)? };
        let requirements = unsafe { context.raw.get_image_memory_requirements(raw) };

        let allocation = context.allocator.lock().allocate(&AllocationCreateDesc {
            name: "image",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        unsafe {
            context
                .raw
                .bind_image_memory(raw, allocation.memory(), allocation.offset())?;
        };

        Ok(Self {
            raw,
            allocation: Some(allocation),
            extent: desc.extent,
            level_count: desc.level_count,
            layer_count: desc.layer_count,
            face_count: desc.face_count,
            usage_flags: desc.usage_flags | vk::ImageUsageFlags::TRANSFER_DST,
            format: desc.format,
            swapchain_backed: false,
            context,
        })
    }

    pub(crate) fn from_swapchain(
        context: Arc<ContextShared>,
        raw: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            raw,
            allocation: None,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            level_count: 1,
            layer_count: 1,
            face_count: 1,
            usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            format,
            swapchain_backed: true,
            context,
        }
    }

    /// Non-owning copy used to patch the backbuffer resource to the acquired
    /// swapchain image.
    pub(crate) fn alias(&self) -> Image {
        Image {
            raw: self.raw,
            allocation: None,
            extent: self.extent,
            level_count: self.level_count,
            layer_count: self.layer_count,
            face_count: self.face_count,
            usage_flags: self.usage_flags,
            format: self.format,
            swapchain_backed: true,
            context: self.context.clone(),
        }
    }

    pub fn full_subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(format_aspect_mask(self.format))
            .base_mip_level(0)
            .level_count(self.level_count)
            .base_array_layer(0)
            .layer_count(self.layer_count * self.face_count)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.swapchain_backed {
            return;
        }
        if let Some(allocation) = self.allocation.take() {
            self.context
                .schedule_destruction_image(PendingDestructionImage {
                    raw: self.raw,
                    allocation,
                });
        }
    }
}

impl_set_name!(Image);

pub struct ImageView {
    pub(crate) raw: vk::ImageView,
    external: bool,
    context: Arc<ContextShared>,
}

impl ImageView {
    pub fn new(
        context: Arc<ContextShared>,
        image: &Image,
        subresource_range: vk::ImageSubresourceRange,
    ) -> Result<Self> {
        let view_type = image_view_type(image.extent, image.layer_count, image.face_count);
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image.raw)
            .view_type(view_type)
            .format(image.format)
            .subresource_range(subresource_range);
        let raw = unsafe { context.raw.create_image_view(&create_info, None)? };

        Ok(Self {
            raw,
            external: false,
            context,
        })
    }

    pub(crate) fn from_raw(context: Arc<ContextShared>, raw: vk::ImageView) -> Self {
        Self {
            raw,
            external: true,
            context,
        }
    }

    pub(crate) fn alias(&self) -> ImageView {
        ImageView {
            raw: self.raw,
            external: true,
            context: self.context.clone(),
        }
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        if !self.external {
            self.context.schedule_destruction_image_view(self.raw);
        }
    }
}

impl_set_name!(ImageView);

pub struct SamplerDescriptor {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    pub max_lod: f32,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            max_lod: vk::LOD_CLAMP_NONE,
        }
    }
}

pub struct Sampler {
    pub(crate) raw: vk::Sampler,
    context: Arc<ContextShared>,
}

impl Sampler {
    pub fn new(context: Arc<ContextShared>, desc: SamplerDescriptor) -> Result<Self> {
        let create_info = vk::SamplerCreateInfo::default()
            .min_filter(desc.min_filter)
            .mag_filter(desc.mag_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .min_lod(0.0)
            .max_lod(desc.max_lod)
            .border_color(vk::BorderColor::INT_OPAQUE_WHITE);

        let raw = unsafe { context.raw.create_sampler(&create_info, None)? };

        Ok(Self { raw, context })
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.context.schedule_destruction_sampler(self.raw);
    }
}

impl_set_name!(Sampler);

pub struct ShaderModule {
    pub(crate) raw: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
    context: Arc<ContextShared>,
}

impl ShaderModule {
    pub fn from_spirv_file(
        context: Arc<ContextShared>,
        path: impl AsRef<Path>,
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read shader binary {}", path.display()))?;
        Self::from_spirv_bytes(context, &bytes, stage)
    }

    /// Compiles a GLSL source file through the glslangValidator CLI and
    /// builds the module from the resulting SPIR-V. The binary lands next to
    /// the source with an `.spv` suffix.
    pub fn from_glsl_file(
        context: Arc<ContextShared>,
        path: impl AsRef<Path>,
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = compile_glsl_through_glslangvalidator_cli(path, stage)?;
        Self::from_spirv_bytes(context, &bytes, stage)
    }

    fn from_spirv_bytes(
        context: Arc<ContextShared>,
        bytes: &[u8],
        stage: vk::ShaderStageFlags,
    ) -> Result<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V")?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let raw = unsafe { context.raw.create_shader_module(&create_info, None)? };

        Ok(Self { raw, stage, context })
    }
}

fn glslang_stage_extension(stage: vk::ShaderStageFlags) -> &'static str {
    match stage {
        vk::ShaderStageFlags::VERTEX => "vert",
        vk::ShaderStageFlags::FRAGMENT => "frag",
        vk::ShaderStageFlags::COMPUTE => "comp",
        vk::ShaderStageFlags::GEOMETRY => "geom",
        _ => "vert",
    }
}

fn compile_glsl_through_glslangvalidator_cli(
    source_path: &Path,
    stage: vk::ShaderStageFlags,
) -> Result<Vec<u8>> {
    let command_name = match std::env::consts::OS {
        "windows" => "glslangvalidator.exe",
        _ => "glslangValidator",
    };

    let mut binary_path = source_path.as_os_str().to_owned();
    binary_path.push(".spv");

    let command_output = std::process::Command::new(command_name)
        .arg(source_path)
        .arg("-V")
        .args(["--target-env", "vulkan1.3"])
        .arg("-o")
        .arg(&binary_path)
        .args(["-S", glslang_stage_extension(stage)])
        .output()
        .with_context(|| format!("Failed to run {}", command_name))?;

    if !command_output.status.success() {
        log::error!(
            "glslangValidator returned error: {:?}",
            String::from_utf8_lossy(&command_output.stdout)
        );
        anyhow::bail!(
            "Failed to compile shader {} through glslangValidator",
            source_path.display()
        );
    }

    let bytes = std::fs::read(&binary_path)
        .with_context(|| "Failed to read compiled shader binary")?;
    Ok(bytes)
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.context.raw.destroy_shader_module(self.raw, None);
        }
    }
}

impl_set_name!(ShaderModule);

pub struct QueryPool {
    pub(crate) raw: vk::QueryPool,
    pub query_count: u32,
    context: Arc<ContextShared>,
}

impl QueryPool {
    pub fn new(context: Arc<ContextShared>, query_type: vk::QueryType, count: u32) -> Result<Self> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(query_type)
            .query_count(count);
        let raw = unsafe { context.raw.create_query_pool(&create_info, None)? };

        Ok(Self {
            raw,
            query_count: count,
            context,
        })
    }

    /// Non-blocking readback; fails when the results are not ready yet.
    pub fn get_results(&self, first_query: u32, results: &mut [u64]) -> Result<()> {
        unsafe {
            self.context.raw.get_query_pool_results(
                self.raw,
                first_query,
                results,
                vk::QueryResultFlags::TYPE_64,
            )?;
        }
        Ok(())
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        unsafe {
            self.context.raw.destroy_query_pool(self.raw, None);
        }
    }
}

impl_set_name!(QueryPool);

/// Accumulates descriptor bindings; every binding gets
/// `UPDATE_AFTER_BIND | PARTIALLY_BOUND` behavior.
#[derive(Default)]
pub struct DescriptorLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    binding_flags: Vec<vk::DescriptorBindingFlags>,
}

impl DescriptorLayoutBuilder {
    pub fn add_binding(
        &mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        descriptor_count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> &mut Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(descriptor_count)
                .stage_flags(stage_flags),
        );
        self.binding_flags.push(
            vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                | vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        );
        self
    }
}

pub struct DescriptorSetLayout {
    pub(crate) raw: vk::DescriptorSetLayout,
    context: Arc<ContextShared>,
}

impl DescriptorSetLayout {
    pub fn new(context: Arc<ContextShared>, builder: &DescriptorLayoutBuilder) -> Result<Self> {
        let mut binding_flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::default()
            .binding_flags(&builder.binding_flags);
        let create_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&builder.bindings)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut binding_flags_info);

        let raw = unsafe { context.raw.create_descriptor_set_layout(&create_info, None)? };

        Ok(Self { raw, context })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.context
                .raw
                .destroy_descriptor_set_layout(self.raw, None);
        }
    }
}

impl_set_name!(DescriptorSetLayout);

pub struct DescriptorPool {
    pub(crate) raw: vk::DescriptorPool,
    context: Arc<ContextShared>,
}

impl DescriptorPool {
    pub fn new(
        context: Arc<ContextShared>,
        pool_sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(
                vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET
                    | vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND,
            )
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let raw = unsafe { context.raw.create_descriptor_pool(&create_info, None)? };

        Ok(Self { raw, context })
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.context.raw.destroy_descriptor_pool(self.raw, None);
        }
    }
}

impl_set_name!(DescriptorPool);

pub struct DescriptorSet {
    pub(crate) raw: vk::DescriptorSet,
    context: Arc<ContextShared>,
}

impl DescriptorSet {
    pub fn allocate(
        context: Arc<ContextShared>,
        pool: &DescriptorPool,
        layout: &DescriptorSetLayout,
    ) -> Result<Self> {
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool.raw)
            .set_layouts(std::slice::from_ref(&layout.raw));
        let raws = unsafe { context.raw.allocate_descriptor_sets(&allocate_info)? };

        Ok(Self {
            raw: raws[0],
            context,
        })
    }
}

impl_set_name!(DescriptorSet);

#[derive(Default)]
pub struct PipelineLayoutBuilder {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl PipelineLayoutBuilder {
    pub fn add_layout(&mut self, layout: &DescriptorSetLayout) -> &mut Self {
        self.set_layouts.push(layout.raw);
        self
    }

    pub fn add_range(
        &mut self,
        stage_flags: vk::ShaderStageFlags,
        offset: u32,
        size: u32,
    ) -> &mut Self {
        self.push_constant_ranges.push(
            vk::PushConstantRange::default()
                .stage_flags(stage_flags)
                .offset(offset)
                .size(size),
        );
        self
    }
}

pub struct PipelineLayout {
    pub(crate) raw: vk::PipelineLayout,
    context: Arc<ContextShared>,
}

impl PipelineLayout {
    pub fn new(context: Arc<ContextShared>, builder: &PipelineLayoutBuilder) -> Result<Self> {
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&builder.set_layouts)
            .push_constant_ranges(&builder.push_constant_ranges);
        let raw = unsafe { context.raw.create_pipeline_layout(&create_info, None)? };

        Ok(Self { raw, context })
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.context.raw.destroy_pipeline_layout(self.raw, None);
        }
    }
}

impl_set_name!(PipelineLayout);

pub struct PipelineCache {
    pub(crate) raw: vk::PipelineCache,
    context: Arc<ContextShared>,
}

impl PipelineCache {
    pub fn new(context: Arc<ContextShared>, initial_data: &[u8]) -> Result<Self> {
        let create_info = vk::PipelineCacheCreateInfo::default().initial_data(initial_data);
        let raw = unsafe { context.raw.create_pipeline_cache(&create_info, None)? };

        Ok(Self { raw, context })
    }

    /// Serialized cache contents, suitable to seed the next run.
    pub fn data(&self) -> Result<Vec<u8>> {
        let data = unsafe { self.context.raw.get_pipeline_cache_data(self.raw)? };
        Ok(data)
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        unsafe {
            self.context.raw.destroy_pipeline_cache(self.raw, None);
        }
    }
}

impl_set_name!(PipelineCache);

pub struct GraphicsPipelineDescriptor<'a> {
    pub vertex_shader: &'a ShaderModule,
    pub fragment_shader: &'a ShaderModule,
    pub layout: &'a PipelineLayout,
    pub cache: Option<&'a PipelineCache>,
    pub color_attachment_formats: Vec<vk::Format>,
    pub depth_attachment_format: vk::Format,
    pub alpha_blend: bool,
}

pub struct Pipeline {
    pub(crate) raw: vk::Pipeline,
    pub(crate) bind_point: vk::PipelineBindPoint,
    context: Arc<ContextShared>,
}

impl Pipeline {
    /// Builds a dynamic-rendering graphics pipeline with no vertex input
    /// (vertices are pulled from a buffer address in the shader) and dynamic
    /// viewport/scissor.
    pub fn new_graphics(
        context: Arc<ContextShared>,
        desc: GraphicsPipelineDescriptor,
    ) -> Result<Self> {
        let shader_entry_point_name = CString::new("main").unwrap();
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(desc.vertex_shader.raw)
                .name(&shader_entry_point_name),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(desc.fragment_shader.raw)
                .name(&shader_entry_point_name),
        ];

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default();

        let color_blend_attachments = desc
            .color_attachment_formats
            .iter()
            .map(|_| {
                let mut attachment = vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA);
                if desc.alpha_blend {
                    attachment = attachment
                        .blend_enable(true)
                        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                        .color_blend_op(vk::BlendOp::ADD)
                        .src_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                        .alpha_blend_op(vk::BlendOp::ADD);
                }
                attachment
            })
            .collect::<Vec<_>>();
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut pipeline_rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&desc.color_attachment_formats)
            .depth_attachment_format(desc.depth_attachment_format);

        let pipeline_create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout.raw)
            .push_next(&mut pipeline_rendering_info);

        let cache_raw = desc
            .cache
            .map_or(vk::PipelineCache::null(), |cache| cache.raw);
        let raw = unsafe {
            context
                .raw
                .create_graphics_pipelines(
                    cache_raw,
                    std::slice::from_ref(&pipeline_create_info),
                    None,
                )
                .map_err(|e| e.1)?[0]
        };

        Ok(Self {
            raw,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            context,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.context.schedule_destruction_pipeline(self.raw);
    }
}

impl_set_name!(Pipeline);
