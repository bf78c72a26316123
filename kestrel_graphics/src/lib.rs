//! Vulkan rendering core: frame lifecycle, bindless resources and
//! asynchronous uploads.

pub mod gui;
pub mod handle;
pub mod renderer;
pub mod runtime;
pub mod uploader;
pub mod vulkan;

pub use handle::Handle;
pub use renderer::{Renderer, RendererDescriptor, FRAME_OVERLAP};
pub use runtime::Runtime;
pub use uploader::Uploader;
pub use vulkan::{
    types::ResourceState, Context, Queue, QueueCaps, QueueRequest, QueueStrategy, TimelineSignal,
};
