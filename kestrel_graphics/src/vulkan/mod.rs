use std::{
    collections::HashMap,
    ffi::{c_void, CStr, CString},
    mem::ManuallyDrop,
    sync::Arc,
};

use anyhow::{Context as _, Result};
use ash::{ext::debug_utils, khr};
use bitflags::bitflags;
use gpu_allocator::{
    vulkan::{Allocation, Allocator, AllocatorCreateDesc},
    AllocationSizes, AllocatorDebugSettings,
};
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

pub mod command;
pub mod resource;
pub mod swapchain;
pub mod types;

/// External dependencies exposed outside of current crate.
pub use ash::{self, vk};
pub use gpu_allocator;
pub use raw_window_handle;

const VALIDATION_LAYER_NAME: &str = "VK_LAYER_KHRONOS_validation";

struct Instance {
    entry: ash::Entry,
    raw: ash::Instance,
    debug_utils: debug_utils::Instance,
    debug_utils_messenger: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    fn new(display_handle: RawDisplayHandle) -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };

        let app_name = CString::new("kestrel").unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .api_version(vk::API_VERSION_1_3);

        let mut extension_names =
            ash_window::enumerate_required_extensions(display_handle)?.to_vec();
        extension_names.push(debug_utils::NAME.as_ptr());

        let layer_strings = Self::select_layers(&entry);
        let layer_names: Vec<*const i8> =
            layer_strings.iter().map(|c_str| c_str.as_ptr()).collect();

        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_names)
            .enabled_layer_names(&layer_names);

        let raw = unsafe { entry.create_instance(&instance_info, None)? };

        let debug_utils_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_utils_callback));

        let debug_utils = debug_utils::Instance::new(&entry, &raw);
        let debug_utils_messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&debug_utils_info, None)? };

        Ok(Self {
            entry,
            raw,
            debug_utils,
            debug_utils_messenger,
        })
    }

    /// Enables the Khronos validation layer in debug builds when the loader
    /// exposes it.
    fn select_layers(entry: &ash::Entry) -> Vec<CString> {
        if !cfg!(debug_assertions) {
            return Vec::new();
        }

        let available = unsafe {
            entry
                .enumerate_instance_layer_properties()
                .unwrap_or_default()
        };
        let validation_available = available.iter().any(|layer| {
            let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
            name.to_str().map(|n| n == VALIDATION_LAYER_NAME) == Ok(true)
        });

        if validation_available {
            vec![CString::new(VALIDATION_LAYER_NAME).unwrap()]
        } else {
            log::warn!("Validation layer requested but not available");
            Vec::new()
        }
    }

    fn get_adapters(&self, surface: &Surface) -> Result<Vec<Adapter>> {
        let physical_devices = unsafe { self.raw.enumerate_physical_devices()? };
        physical_devices
            .into_iter()
            .map(|physical_device| Adapter::new_from_vulkan_handle(&self.raw, surface, physical_device))
            .collect::<Result<_>>()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::trace!("Instance dropped");
        unsafe {
            self.debug_utils
                .destroy_debug_utils_messenger(self.debug_utils_messenger, None);
            self.raw.destroy_instance(None);
        }
    }
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let severity = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => "[Verbose]",
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => "[Warning]",
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => "[Error]",
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => "[Info]",
        _ => "[Unknown]",
    };
    let types = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let message = CStr::from_ptr((*p_callback_data).p_message);
    log::debug!("[VK Debug]{}{}{:?}", severity, types, message);

    vk::FALSE
}

struct Surface {
    raw_ash: khr::surface::Instance,
    raw_vulkan: vk::SurfaceKHR,
}

impl Surface {
    fn new(
        instance: &Instance,
        window_handle: RawWindowHandle,
        display_handle: RawDisplayHandle,
    ) -> Result<Self> {
        let raw_ash = khr::surface::Instance::new(&instance.entry, &instance.raw);
        let raw_vulkan = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.raw,
                display_handle,
                window_handle,
                None,
            )?
        };

        Ok(Self {
            raw_ash,
            raw_vulkan,
        })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.raw_ash.destroy_surface(self.raw_vulkan, None);
        }
    }
}

const DEVICE_EXTENSIONS_REQUIRED: &[&CStr] = &[khr::swapchain::NAME];
const DEVICE_EXTENSIONS_OPTIONAL: &[&CStr] = &[
    ash::ext::memory_budget::NAME,
    ash::ext::memory_priority::NAME,
];

#[derive(Clone)]
struct Adapter {
    raw: vk::PhysicalDevice,
    name: String,
    properties: vk::PhysicalDeviceProperties,
    queue_families: Vec<QueueFamily>,
    supported_extensions: Vec<String>,
}

impl Adapter {
    fn new_from_vulkan_handle(
        instance: &ash::Instance,
        surface: &Surface,
        raw: vk::PhysicalDevice,
    ) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(raw) };
        let name = unsafe {
            CStr::from_ptr(properties.device_name.as_ptr())
                .to_str()
                .unwrap_or("unknown")
                .to_owned()
        };

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(raw) };
        let queue_families = queue_family_properties
            .into_iter()
            .enumerate()
            .map(|(index, properties)| {
                let present_support = unsafe {
                    surface.raw_ash.get_physical_device_surface_support(
                        raw,
                        index as _,
                        surface.raw_vulkan,
                    )?
                };
                Ok(QueueFamily::new(index as _, properties, present_support))
            })
            .collect::<Result<_>>()?;

        let extension_properties = unsafe { instance.enumerate_device_extension_properties(raw)? };
        let supported_extensions = extension_properties
            .into_iter()
            .map(|properties| {
                let name = unsafe { CStr::from_ptr(properties.extension_name.as_ptr()) };
                name.to_str().unwrap_or("").to_owned()
            })
            .collect();

        Ok(Self {
            raw,
            name,
            properties,
            queue_families,
            supported_extensions,
        })
    }

    fn supports_extension(&self, extension: &CStr) -> bool {
        let Ok(name) = extension.to_str() else {
            return false;
        };
        self.supported_extensions.iter().any(|ext| ext == name)
    }

    /// Returns the selection score, or `None` when the adapter misses a
    /// required device extension or cannot present to the surface.
    fn score(&self) -> Option<i32> {
        for required in DEVICE_EXTENSIONS_REQUIRED {
            if !self.supports_extension(required) {
                return None;
            }
        }
        if !self.queue_families.iter().any(|family| family.supports_present) {
            return None;
        }

        let mut score = 0;
        if self.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1000;
        }
        if self.properties.api_version >= vk::API_VERSION_1_3 {
            score += 500;
        }
        for optional in DEVICE_EXTENSIONS_OPTIONAL {
            if self.supports_extension(optional) {
                score += 100;
            }
        }
        for family in &self.queue_families {
            score += family.properties.queue_count as i32 * 10;
        }

        Some(score)
    }
}

fn select_adapter(adapters: &[Adapter]) -> Result<Adapter> {
    let adapter = adapters
        .iter()
        .filter_map(|adapter| adapter.score().map(|score| (score, adapter)))
        .max_by_key(|(score, _)| *score)
        .map(|(_, adapter)| adapter)
        .ok_or_else(|| anyhow::anyhow!("No suitable Vulkan adapter found"))?;

    Ok(adapter.clone())
}

bitflags! {
    /// Capabilities a queue family can expose, used by [`QueueRequest`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct QueueCaps: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const SPARSE_BINDING = 1 << 3;
        const PROTECTED = 1 << 4;
        const VIDEO_DECODE = 1 << 5;
        const VIDEO_ENCODE = 1 << 6;
        const PRESENT = 1 << 7;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum QueueStrategy {
    /// Family capabilities must equal the requested set exactly.
    Exact,
    /// Penalize families exposing capabilities beyond the requested ones.
    PreferDedicated,
    /// Reward families exposing more capabilities.
    PreferShared,
    /// First family satisfying the requirements wins.
    #[default]
    Minimal,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QueueRequest {
    pub required_caps: QueueCaps,
    pub preferred_caps: QueueCaps,
    pub strategy: QueueStrategy,
    /// When set, families already handed out by the context are skipped as
    /// long as another candidate exists.
    pub prefer_separate_family: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueFamily {
    pub(crate) index: u32,
    pub(crate) properties: vk::QueueFamilyProperties,
    pub(crate) supports_present: bool,
}

impl QueueFamily {
    fn new(index: u32, properties: vk::QueueFamilyProperties, supports_present: bool) -> Self {
        Self {
            index,
            properties,
            supports_present,
        }
    }

    pub(crate) fn caps(&self) -> QueueCaps {
        let mut caps = QueueCaps::empty();
        let flags = self.properties.queue_flags;
        if flags.contains(vk::QueueFlags::GRAPHICS) {
            caps |= QueueCaps::GRAPHICS;
        }
        if flags.contains(vk::QueueFlags::COMPUTE) {
            caps |= QueueCaps::COMPUTE;
        }
        if flags.contains(vk::QueueFlags::TRANSFER) {
            caps |= QueueCaps::TRANSFER;
        }
        if flags.contains(vk::QueueFlags::SPARSE_BINDING) {
            caps |= QueueCaps::SPARSE_BINDING;
        }
        if flags.contains(vk::QueueFlags::PROTECTED) {
            caps |= QueueCaps::PROTECTED;
        }
        if flags.contains(vk::QueueFlags::VIDEO_DECODE_KHR) {
            caps |= QueueCaps::VIDEO_DECODE;
        }
        if flags.contains(vk::QueueFlags::VIDEO_ENCODE_KHR) {
            caps |= QueueCaps::VIDEO_ENCODE;
        }
        if self.supports_present {
            caps |= QueueCaps::PRESENT;
        }
        caps
    }
}

/// Scores a queue family against a request. `None` means the family cannot
/// serve the request at all.
fn queue_family_score(caps: QueueCaps, request: &QueueRequest) -> Option<i32> {
    if request.strategy == QueueStrategy::Exact {
        return (caps == request.required_caps).then_some(1000);
    }

    if !caps.contains(request.required_caps) {
        return None;
    }

    let mut score = 100;
    match request.strategy {
        QueueStrategy::PreferDedicated => {
            let extra = caps & !request.required_caps;
            score -= extra.bits().count_ones() as i32 * 10;
        }
        QueueStrategy::PreferShared => {
            score += caps.bits().count_ones() as i32 * 5;
        }
        QueueStrategy::Minimal | QueueStrategy::Exact => {}
    }

    if !request.preferred_caps.is_empty() {
        if caps.contains(request.preferred_caps) {
            score += 30;
        } else {
            let matched = caps & request.preferred_caps;
            score += matched.bits().count_ones() as i32 * 5;
        }
    }

    if caps.contains(QueueCaps::PRESENT) {
        score += 2;
    }

    Some(score)
}

fn select_queue_family(
    families: &[QueueFamily],
    request: &QueueRequest,
    used_families: &[u32],
) -> Option<u32> {
    let best = |skip_used: bool| {
        families
            .iter()
            .filter(|family| family.properties.queue_count > 0)
            .filter(|family| !skip_used || !used_families.contains(&family.index))
            .filter_map(|family| {
                queue_family_score(family.caps(), request).map(|score| (score, family.index))
            })
            // Ties resolve to the lowest family index.
            .max_by_key(|(score, index)| (*score, std::cmp::Reverse(*index)))
            .map(|(_, index)| index)
    };

    if request.prefer_separate_family {
        if let Some(index) = best(true) {
            return Some(index);
        }
    }
    best(false)
}

pub(crate) struct QueueSubmitSemaphoreDescriptor {
    pub(crate) semaphore: vk::Semaphore,
    pub(crate) stage_mask: vk::PipelineStageFlags2,
    /// Only meaningful for timeline semaphores.
    pub(crate) value: u64,
}

/// Device queue plus the lock serializing submissions to it. Queues handed
/// out for the same family share the lock, so a transfer queue falling back
/// to the direct family stays safe to submit from another thread.
#[derive(Clone)]
pub struct Queue {
    pub(crate) raw: vk::Queue,
    pub(crate) family_index: u32,
    pub(crate) caps: QueueCaps,
    device: ash::Device,
    pub(crate) submit_lock: Arc<Mutex<()>>,
}

impl Queue {
    pub(crate) fn submit_command_buffers(
        &self,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[QueueSubmitSemaphoreDescriptor],
        signal_semaphores: &[QueueSubmitSemaphoreDescriptor],
        fence: vk::Fence,
    ) -> Result<()> {
        let to_submit_info = |descriptor: &QueueSubmitSemaphoreDescriptor| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(descriptor.semaphore)
                .stage_mask(descriptor.stage_mask)
                .value(descriptor.value)
        };

        let wait_semaphores_info = wait_semaphores.iter().map(to_submit_info).collect::<Vec<_>>();
        let signal_semaphores_info = signal_semaphores
            .iter()
            .map(to_submit_info)
            .collect::<Vec<_>>();

        let command_buffer_submit_infos = command_buffers
            .iter()
            .map(|command_buffer| {
                vk::CommandBufferSubmitInfo::default().command_buffer(*command_buffer)
            })
            .collect::<Vec<_>>();

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_semaphores_info)
            .signal_semaphore_infos(&signal_semaphores_info)
            .command_buffer_infos(&command_buffer_submit_infos);

        let _guard = self.submit_lock.lock();
        unsafe {
            self.device
                .queue_submit2(self.raw, std::slice::from_ref(&submit_info), fence)?
        };

        Ok(())
    }

    pub fn wait_idle(&self) -> Result<()> {
        let _guard = self.submit_lock.lock();
        unsafe {
            self.device.queue_wait_idle(self.raw)?;
        }
        Ok(())
    }
}

/// Raw handle + value pair published by the uploader and consumed as a
/// frame submission wait.
#[derive(Clone, Copy, Debug)]
pub struct TimelineSignal {
    pub semaphore: vk::Semaphore,
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

/// Device resources whose owners have gone away, waiting for the next safe
/// point to be destroyed. Owners only drop into the hub once the GPU can no
/// longer reference the resource.
#[derive(Default)]
pub(crate) struct DestructionHub {
    pub(crate) buffers: Vec<PendingDestructionBuffer>,
    pub(crate) images: Vec<PendingDestructionImage>,
    pub(crate) image_views: Vec<vk::ImageView>,
    pub(crate) samplers: Vec<vk::Sampler>,
    pub(crate) pipelines: Vec<vk::Pipeline>,
}

pub(crate) struct PendingDestructionBuffer {
    pub(crate) raw: vk::Buffer,
    pub(crate) allocation: Allocation,
}

pub(crate) struct PendingDestructionImage {
    pub(crate) raw: vk::Image,
    pub(crate) allocation: Allocation,
}

/// Shared device state: everything the resource wrappers need to create and
/// destroy themselves. Held behind `Arc` by every wrapper.
pub struct ContextShared {
    pub(crate) allocator: ManuallyDrop<Mutex<Allocator>>,
    pub(crate) raw: ash::Device,
    pub(crate) swapchain_fn: khr::swapchain::Device,
    pub(crate) debug_utils_fn: debug_utils::Device,
    pub(crate) destruction_hub: Mutex<DestructionHub>,
    queue_locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
    used_queue_families: Mutex<Vec<u32>>,
    adapter: Adapter,
    surface: Surface,
    instance: Instance,
}

impl ContextShared {
    fn new(instance: Instance, surface: Surface) -> Result<Self> {
        let adapters = instance.get_adapters(&surface)?;
        let adapter = select_adapter(&adapters)?;

        log::info!("Selected adapter: {}", adapter.name);

        let raw = Self::new_ash_device(&instance, &adapter)?;
        let swapchain_fn = khr::swapchain::Device::new(&instance.raw, &raw);
        let debug_utils_fn = debug_utils::Device::new(&instance.raw, &raw);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.raw.clone(),
            device: raw.clone(),
            physical_device: adapter.raw,
            debug_settings: AllocatorDebugSettings {
                log_leaks_on_shutdown: true,
                ..Default::default()
            },
            buffer_device_address: true,
            allocation_sizes: AllocationSizes::default(),
        })?;

        Ok(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            raw,
            swapchain_fn,
            debug_utils_fn,
            destruction_hub: Mutex::new(DestructionHub::default()),
            queue_locks: Mutex::new(HashMap::new()),
            used_queue_families: Mutex::new(Vec::new()),
            adapter,
            surface,
            instance,
        })
    }

    fn new_ash_device(instance: &Instance, adapter: &Adapter) -> Result<ash::Device> {
        let queue_priorities = [1.0f32];

        let queue_create_infos = adapter
            .queue_families
            .iter()
            .filter(|family| family.properties.queue_count > 0)
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family.index)
                    .queue_priorities(&queue_priorities)
            })
            .collect::<Vec<_>>();

        let mut extension_names = DEVICE_EXTENSIONS_REQUIRED
            .iter()
            .map(|name| name.as_ptr())
            .collect::<Vec<_>>();
        for optional in DEVICE_EXTENSIONS_OPTIONAL {
            if adapter.supports_extension(optional) {
                extension_names.push(optional.as_ptr());
            }
        }

        let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .timeline_semaphore(true)
            .buffer_device_address(true)
            .shader_float16(true)
            .shader_int8(true);
        let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);

        let mut device_features2 = vk::PhysicalDeviceFeatures2::default();
        unsafe {
            instance
                .raw
                .get_physical_device_features2(adapter.raw, &mut device_features2);
        }
        device_features2 = device_features2
            .push_next(&mut vulkan12_features)
            .push_next(&mut vulkan13_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut device_features2);

        let device = unsafe {
            instance
                .raw
                .create_device(adapter.raw, &device_create_info, None)?
        };

        Ok(device)
    }

    pub(crate) fn adapter_properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.adapter.properties
    }

    pub(crate) fn surface_raw(&self) -> vk::SurfaceKHR {
        self.surface.raw_vulkan
    }

    pub(crate) fn surface_fn(&self) -> &khr::surface::Instance {
        &self.surface.raw_ash
    }

    pub(crate) fn adapter_raw(&self) -> vk::PhysicalDevice {
        self.adapter.raw
    }

    pub(crate) fn schedule_destruction_buffer(&self, pending: PendingDestructionBuffer) {
        self.destruction_hub.lock().buffers.push(pending);
    }

    pub(crate) fn schedule_destruction_image(&self, pending: PendingDestructionImage) {
        self.destruction_hub.lock().images.push(pending);
    }

    pub(crate) fn schedule_destruction_image_view(&self, raw: vk::ImageView) {
        self.destruction_hub.lock().image_views.push(raw);
    }

    pub(crate) fn schedule_destruction_sampler(&self, raw: vk::Sampler) {
        self.destruction_hub.lock().samplers.push(raw);
    }

    pub(crate) fn schedule_destruction_pipeline(&self, raw: vk::Pipeline) {
        self.destruction_hub.lock().pipelines.push(raw);
    }

    /// Destroys everything scheduled so far. Callers guarantee the GPU no
    /// longer references any of it (fence wait, semaphore lap, queue idle).
    pub(crate) fn drain_destruction(&self) {
        let mut hub = self.destruction_hub.lock();
        let mut allocator = self.allocator.lock();
        unsafe {
            for buffer in hub.buffers.drain(..) {
                self.raw.destroy_buffer(buffer.raw, None);
                if let Err(error) = allocator.free(buffer.allocation) {
                    log::error!("Failed to free buffer allocation: {}", error);
                }
            }
            for image in hub.images.drain(..) {
                self.raw.destroy_image(image.raw, None);
                if let Err(error) = allocator.free(image.allocation) {
                    log::error!("Failed to free image allocation: {}", error);
                }
            }
            for view in hub.image_views.drain(..) {
                self.raw.destroy_image_view(view, None);
            }
            for sampler in hub.samplers.drain(..) {
                self.raw.destroy_sampler(sampler, None);
            }
            for pipeline in hub.pipelines.drain(..) {
                self.raw.destroy_pipeline(pipeline, None);
            }
        }
    }

    /// Attaches a debug-utils name to a Vulkan object. Best effort; naming
    /// failures are only logged.
    pub(crate) fn set_object_name<T: vk::Handle>(&self, handle: T, name: &str) {
        let Ok(object_name) = CString::new(name) else {
            return;
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(object_name.as_c_str());
        unsafe {
            if let Err(error) = self.debug_utils_fn.set_debug_utils_object_name(&name_info) {
                log::debug!("Failed to set object name {:?}: {}", object_name, error);
            }
        }
    }

    fn submit_lock_for_family(&self, family_index: u32) -> Arc<Mutex<()>> {
        self.queue_locks
            .lock()
            .entry(family_index)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Implements `set_name` for wrappers holding `raw` + `context` fields.
macro_rules! impl_set_name {
    ($wrapper:ty) => {
        impl $wrapper {
            pub fn set_name(&self, name: &str) {
                self.context.set_object_name(self.raw, name);
            }
        }
    };
}
pub(crate) use impl_set_name;

impl Drop for ContextShared {
    fn drop(&mut self) {
        log::trace!("Context dropped");
        unsafe {
            if let Err(error) = self.raw.device_wait_idle() {
                log::error!("Device wait idle failed at shutdown: {}", error);
            }
        }
        self.drain_destruction();
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.raw.destroy_device(None);
        }
    }
}

/// Process-wide Vulkan bring-up: loader, instance, surface, adapter
/// selection, device and allocator. Must outlive every resource created
/// through it; resource wrappers keep it alive through `Arc`.
pub struct Context {
    pub(crate) shared: Arc<ContextShared>,
}

impl Context {
    pub fn new(display_handle: RawDisplayHandle, window_handle: RawWindowHandle) -> Result<Self> {
        let instance = Instance::new(display_handle)?;
        let surface = Surface::new(&instance, window_handle, display_handle)?;
        let shared = Arc::new(ContextShared::new(instance, surface)?);

        Ok(Self { shared })
    }

    /// Resolves a queue request against the adapter's families. The returned
    /// queue shares a submit lock with every other queue of its family.
    pub fn request_queue(&self, request: QueueRequest) -> Result<Queue> {
        let used = self.shared.used_queue_families.lock().clone();
        let family_index =
            select_queue_family(&self.shared.adapter.queue_families, &request, &used)
                .context("No queue family satisfies the request")?;

        let family = self.shared.adapter.queue_families[family_index as usize];
        let raw = unsafe { self.shared.raw.get_device_queue(family_index, 0) };

        self.shared.used_queue_families.lock().push(family_index);

        Ok(Queue {
            raw,
            family_index,
            caps: family.caps(),
            device: self.shared.raw.clone(),
            submit_lock: self.shared.submit_lock_for_family(family_index),
        })
    }

    pub fn max_push_constants_size(&self) -> u32 {
        self.shared.adapter_properties().limits.max_push_constants_size
    }

    pub fn timestamp_period(&self) -> f32 {
        self.shared.adapter_properties().limits.timestamp_period
    }

    pub fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SemaphoreKind {
    Binary,
    Timeline,
}

pub struct Semaphore {
    context: Arc<ContextShared>,
    pub(crate) raw: vk::Semaphore,
    pub(crate) kind: SemaphoreKind,
}

impl Semaphore {
    pub fn new(context: Arc<ContextShared>, kind: SemaphoreKind, initial_value: u64) -> Result<Self> {
        let mut semaphore_type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(match kind {
                SemaphoreKind::Binary => vk::SemaphoreType::BINARY,
                SemaphoreKind::Timeline => vk::SemaphoreType::TIMELINE,
            })
            .initial_value(initial_value);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut semaphore_type_info);

        let raw = unsafe { context.raw.create_semaphore(&semaphore_info, None)? };

        Ok(Self { context, raw, kind })
    }

    /// Blocks until the timeline semaphore reaches `value`.
    pub fn wait_value(&self, value: u64, timeout_ns: u64) -> Result<()> {
        debug_assert_eq!(self.kind, SemaphoreKind::Timeline);

        let semaphores = [self.raw];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe {
            self.context.raw.wait_semaphores(&wait_info, timeout_ns)?;
        }
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.context.raw.destroy_semaphore(self.raw, None);
        }
    }
}

impl_set_name!(Semaphore);

pub struct Fence {
    context: Arc<ContextShared>,
    pub(crate) raw: vk::Fence,
}

impl Fence {
    pub fn new(context: Arc<ContextShared>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::default().flags(flags);
        let raw = unsafe { context.raw.create_fence(&fence_info, None)? };

        Ok(Self { context, raw })
    }

    /// Returns whether the fence signaled within the timeout.
    pub fn wait(&self, timeout_ns: u64) -> Result<bool> {
        let result = unsafe {
            self.context
                .raw
                .wait_for_fences(std::slice::from_ref(&self.raw), true, timeout_ns)
        };
        match result {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.context
                .raw
                .reset_fences(std::slice::from_ref(&self.raw))?;
        }
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.context.raw.destroy_fence(self.raw, None);
        }
    }
}

impl_set_name!(Fence);

#[cfg(test)]
mod tests {
    use super::*;

    fn request(required: QueueCaps, strategy: QueueStrategy) -> QueueRequest {
        QueueRequest {
            required_caps: required,
            preferred_caps: QueueCaps::empty(),
            strategy,
            prefer_separate_family: false,
        }
    }

    #[test]
    fn exact_strategy_requires_equality() {
        let transfer_only = request(QueueCaps::TRANSFER, QueueStrategy::Exact);
        assert_eq!(
            queue_family_score(QueueCaps::TRANSFER, &transfer_only),
            Some(1000)
        );
        assert_eq!(
            queue_family_score(QueueCaps::TRANSFER | QueueCaps::COMPUTE, &transfer_only),
            None
        );
    }

    #[test]
    fn missing_required_caps_disqualifies() {
        let graphics = request(QueueCaps::GRAPHICS, QueueStrategy::Minimal);
        assert_eq!(queue_family_score(QueueCaps::TRANSFER, &graphics), None);
    }

    #[test]
    fn dedicated_strategy_penalizes_extras() {
        let transfer = request(QueueCaps::TRANSFER, QueueStrategy::PreferDedicated);
        let dedicated = queue_family_score(QueueCaps::TRANSFER, &transfer).unwrap();
        let shared = queue_family_score(
            QueueCaps::TRANSFER | QueueCaps::GRAPHICS | QueueCaps::COMPUTE,
            &transfer,
        )
        .unwrap();
        assert!(dedicated > shared);
        assert_eq!(dedicated - shared, 20);
    }

    #[test]
    fn shared_strategy_rewards_extras() {
        let transfer = request(QueueCaps::TRANSFER, QueueStrategy::PreferShared);
        let dedicated = queue_family_score(QueueCaps::TRANSFER, &transfer).unwrap();
        let shared = queue_family_score(
            QueueCaps::TRANSFER | QueueCaps::GRAPHICS,
            &transfer,
        )
        .unwrap();
        assert!(shared > dedicated);
    }

    #[test]
    fn preferred_caps_full_match_beats_partial() {
        let mut base = request(QueueCaps::TRANSFER, QueueStrategy::Minimal);
        base.preferred_caps = QueueCaps::GRAPHICS | QueueCaps::COMPUTE;

        let full = queue_family_score(
            QueueCaps::TRANSFER | QueueCaps::GRAPHICS | QueueCaps::COMPUTE,
            &base,
        )
        .unwrap();
        let partial =
            queue_family_score(QueueCaps::TRANSFER | QueueCaps::COMPUTE, &base).unwrap();
        let none = queue_family_score(QueueCaps::TRANSFER, &base).unwrap();

        assert_eq!(full - none, 30);
        assert_eq!(partial - none, 5);
    }

    #[test]
    fn present_support_breaks_ties() {
        let transfer = request(QueueCaps::TRANSFER, QueueStrategy::Minimal);
        let with_present =
            queue_family_score(QueueCaps::TRANSFER | QueueCaps::PRESENT, &transfer).unwrap();
        let without = queue_family_score(QueueCaps::TRANSFER, &transfer).unwrap();
        assert_eq!(with_present - without, 2);
    }

    fn family(index: u32, flags: vk::QueueFlags, present: bool) -> QueueFamily {
        QueueFamily::new(
            index,
            vk::QueueFamilyProperties {
                queue_flags: flags,
                queue_count: 1,
                ..Default::default()
            },
            present,
        )
    }

    #[test]
    fn selection_prefers_dedicated_transfer_family() {
        let families = [
            family(
                0,
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                true,
            ),
            family(1, vk::QueueFlags::TRANSFER, false),
        ];
        let request = request(QueueCaps::TRANSFER, QueueStrategy::PreferDedicated);
        assert_eq!(select_queue_family(&families, &request, &[]), Some(1));
    }

    #[test]
    fn selection_ties_break_by_lowest_index() {
        let families = [
            family(0, vk::QueueFlags::TRANSFER, false),
            family(1, vk::QueueFlags::TRANSFER, false),
        ];
        let request = request(QueueCaps::TRANSFER, QueueStrategy::Minimal);
        assert_eq!(select_queue_family(&families, &request, &[]), Some(0));
    }

    #[test]
    fn separate_family_skips_used_when_possible() {
        let families = [
            family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, true),
            family(1, vk::QueueFlags::TRANSFER, false),
        ];
        let mut req = request(QueueCaps::TRANSFER, QueueStrategy::PreferShared);
        req.prefer_separate_family = true;

        assert_eq!(select_queue_family(&families, &req, &[0]), Some(1));
        // Falls back to a used family when nothing else qualifies.
        let only = [family(
            0,
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
            true,
        )];
        assert_eq!(select_queue_family(&only, &req, &[0]), Some(0));
    }
}
