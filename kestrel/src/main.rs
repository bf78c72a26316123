use std::{
    env,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use winit::{
    dpi,
    event::{Event, WindowEvent},
    event_loop::EventLoop,
    raw_window_handle::{HasDisplayHandle, HasWindowHandle},
    window::{Window, WindowBuilder},
};

use kestrel_graphics::{
    gui::{
        DrawCommand, DrawData, DrawList, DrawVert, GuiRenderer, GuiRendererDescriptor,
        TextureData,
    },
    uploader::ImagePromise,
    vulkan::{types::ResourceState, vk},
    Context, QueueCaps, QueueRequest, QueueStrategy, Renderer, RendererDescriptor, Runtime,
    Uploader,
};

const TARGET_FRAME_TIME: Duration = Duration::from_micros(16_666);

struct DesktopRuntime {
    window: Arc<Window>,
    focused: bool,
    close_requested: bool,
}

impl Runtime for DesktopRuntime {
    fn display_handle(&self) -> winit::raw_window_handle::RawDisplayHandle {
        self.window
            .display_handle()
            .expect("Window has no display handle")
            .as_raw()
    }

    fn window_handle(&self) -> winit::raw_window_handle::RawWindowHandle {
        self.window
            .window_handle()
            .expect("Window has no window handle")
            .as_raw()
    }

    fn surface_extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn scale_factor(&self) -> f64 {
        self.window.scale_factor()
    }

    fn is_focused(&self) -> bool {
        self.focused
    }

    fn process_events(&mut self) {
        // The winit event loop pumps events for us.
    }

    fn requested_close(&self) -> bool {
        self.close_requested
    }
}

/// Field order is teardown order: the GUI pass goes first, then the
/// uploader joins its worker, then the renderer idles the queue and frees
/// its resources, and the context is torn down last.
struct App {
    gui: GuiRenderer,
    uploader: Uploader,
    renderer: Renderer,
    _context: Context,

    textures: Vec<TextureData>,
    pending_image: Option<Arc<ImagePromise>>,
    loaded_image: Option<kestrel_graphics::Handle>,
    last_frame: Instant,
}

impl App {
    fn new(runtime: &DesktopRuntime, image_path: Option<&str>) -> Result<Self> {
        let context = Context::from_runtime(runtime)?;

        let direct_queue = context.request_queue(QueueRequest {
            required_caps: QueueCaps::GRAPHICS
                | QueueCaps::COMPUTE
                | QueueCaps::TRANSFER
                | QueueCaps::PRESENT,
            preferred_caps: QueueCaps::empty(),
            strategy: QueueStrategy::PreferShared,
            prefer_separate_family: false,
        })?;
        let transfer_queue = context.request_queue(QueueRequest {
            required_caps: QueueCaps::TRANSFER,
            preferred_caps: QueueCaps::TRANSFER,
            strategy: QueueStrategy::PreferDedicated,
            prefer_separate_family: true,
        })?;

        let mut renderer = Renderer::new(&context, RendererDescriptor { queue: direct_queue })?;
        let uploader = Uploader::new(&context, transfer_queue)?;

        let shader_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../kestrel_graphics/shaders");
        let gui = GuiRenderer::new(
            &mut renderer,
            GuiRendererDescriptor {
                vertex_shader_path: &shader_dir.join("gui.vert"),
                fragment_shader_path: &shader_dir.join("gui.frag"),
            },
        )?;

        let pending_image = image_path.map(|path| {
            log::info!("Loading image {}", path);
            uploader.load_image(path)
        });

        Ok(Self {
            gui,
            uploader,
            renderer,
            _context: context,
            textures: vec![TextureData::new_rgba8(64, 64, checkerboard_pixels(64, 64))],
            pending_image,
            loaded_image: None,
            last_frame: Instant::now(),
        })
    }

    fn draw_frame(&mut self, runtime: &DesktopRuntime) -> Result<()> {
        self.limit_frame_rate();

        if !runtime.is_focused() {
            return Ok(());
        }

        self.poll_pending_image()?;

        if !self.renderer.frame_begin()? {
            return Ok(());
        }

        let extent = self.renderer.swapchain_extent();
        let mut draw_data = self.build_draw_data(extent);
        self.gui.execute(&mut self.renderer, &mut draw_data)?;
        self.textures = draw_data.textures;

        self.renderer
            .frame_end(self.uploader.last_submitted_semaphore())?;

        Ok(())
    }

    /// Moves a finished upload into the resource table; drawn once the
    /// state translation to ShaderRead lands with the next frame.
    fn poll_pending_image(&mut self) -> Result<()> {
        let Some(promise) = &self.pending_image else {
            return Ok(());
        };
        if !promise.is_done() {
            return Ok(());
        }
        let result = promise.take_result();
        self.pending_image = None;

        match result {
            Some(Ok(image)) => {
                let handle = self.renderer.add_resource();
                self.renderer
                    .attach_image(handle, image, ResourceState::TransferDst)?;
                self.renderer
                    .add_state_translation(handle, ResourceState::ShaderRead);
                self.loaded_image = Some(handle);
                log::info!("Image upload finished");
            }
            Some(Err(error)) => log::error!("Image upload failed: {}", error),
            None => {}
        }

        Ok(())
    }

    fn build_draw_data(&mut self, extent: vk::Extent2D) -> DrawData {
        let width = extent.width as f32;
        let height = extent.height as f32;

        let mut draw_data = DrawData {
            display_pos: [0.0, 0.0],
            display_size: [width, height],
            framebuffer_scale: [1.0, 1.0],
            textures: std::mem::take(&mut self.textures),
            ..Default::default()
        };

        // The quad waits until its texture resource exists; the first frame
        // only issues the create request.
        let texture = self
            .loaded_image
            .map(kestrel_graphics::gui::TextureBinding::new)
            .unwrap_or(draw_data.textures[0].binding);
        if texture.image.is_valid() {
            let mut list = DrawList::default();
            push_quad(
                &mut list,
                [width * 0.25, height * 0.25],
                [width * 0.75, height * 0.75],
                texture,
            );
            draw_data.push_list(list);
        }

        draw_data
    }

    fn limit_frame_rate(&mut self) {
        let elapsed = self.last_frame.elapsed();
        if elapsed < TARGET_FRAME_TIME {
            std::thread::sleep(TARGET_FRAME_TIME - elapsed);
        }
        self.last_frame = Instant::now();
    }
}

fn push_quad(
    list: &mut DrawList,
    min: [f32; 2],
    max: [f32; 2],
    texture: kestrel_graphics::gui::TextureBinding,
) {
    let white = [255u8; 4];
    let base = list.vertices.len() as u32;

    list.vertices.extend_from_slice(&[
        DrawVert {
            pos: [min[0], min[1]],
            uv: [0.0, 0.0],
            col: white,
        },
        DrawVert {
            pos: [max[0], min[1]],
            uv: [1.0, 0.0],
            col: white,
        },
        DrawVert {
            pos: [max[0], max[1]],
            uv: [1.0, 1.0],
            col: white,
        },
        DrawVert {
            pos: [min[0], max[1]],
            uv: [0.0, 1.0],
            col: white,
        },
    ]);
    let index_offset = list.indices.len() as u32;
    list.indices.extend_from_slice(&[
        base as u16,
        base as u16 + 1,
        base as u16 + 2,
        base as u16 + 2,
        base as u16 + 3,
        base as u16,
    ]);

    list.commands.push(DrawCommand {
        clip_rect: [min[0], min[1], max[0], max[1]],
        texture,
        index_offset,
        vertex_offset: 0,
        element_count: 6,
    });
}

fn checkerboard_pixels(width: u32, height: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let dark = ((x / 8) + (y / 8)) % 2 == 0;
            let value = if dark { 64 } else { 220 };
            pixels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    pixels
}

fn main() -> Result<()> {
    let env = env_logger::Env::default().filter_or("KESTREL_LOG", "info");
    env_logger::init_from_env(env);

    let args = env::args().collect::<Vec<_>>();
    let image_path = args.get(1).cloned();

    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        WindowBuilder::new()
            .with_title("kestrel")
            .with_inner_size(dpi::PhysicalSize::new(1280, 720))
            .build(&event_loop)?,
    );

    let mut runtime = DesktopRuntime {
        window: window.clone(),
        focused: true,
        close_requested: false,
    };
    let mut app = App::new(&runtime, image_path.as_deref())?;

    event_loop.run(move |event, elwt| match event {
        Event::WindowEvent { event, .. } => match event {
            WindowEvent::CloseRequested => {
                runtime.close_requested = true;
                elwt.exit();
            }
            WindowEvent::Focused(focused) => {
                runtime.focused = focused;
            }
            WindowEvent::RedrawRequested => {
                if let Err(error) = app.draw_frame(&runtime) {
                    log::error!("Frame failed: {:#}", error);
                    elwt.exit();
                }
            }
            _ => {}
        },
        Event::AboutToWait => {
            window.request_redraw();
        }
        _ => {}
    })?;

    Ok(())
}
