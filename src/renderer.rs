// =============================================================================
// RENDERER - Vulkan side of the frame loop
// =============================================================================
//
// Owns every Vulkan object the triangle needs and implements FrameTarget, so
// FrameScheduler can drive it one frame at a time.
//
// IMPORTANT: Drop order matters. Everything here is destroyed before the
// VulkanDevice (held by Arc) goes away.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use winit::window::Window;

use crate::backend::pipeline;
use crate::backend::swapchain::{choose_surface_format, SwapchainSupport};
use crate::backend::sync::{Acquire, PresentStatus};
use crate::backend::{FrameSync, FrameTarget, GraphicsPipeline, Swapchain, VulkanDevice};
use crate::config::Config;
use crate::math::{self, Vec4};

pub struct Renderer {
    window: Arc<Window>,
    clear_color: Vec4,
    preferred_present_mode: vk::PresentModeKHR,

    // Per frame slot
    frames: Vec<FrameSync>,
    command_buffers: Vec<vk::CommandBuffer>,
    command_pool: vk::CommandPool,

    // Per swapchain generation
    swapchain: Option<Swapchain>,

    // Built once
    pipeline: GraphicsPipeline,
    render_pass: vk::RenderPass,
    device: Arc<VulkanDevice>,
}

/// Window size in pixels as a Vulkan extent
pub fn drawable_extent(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

impl Renderer {
    /// Initialize all Vulkan resources.
    ///
    /// Sets up, in order:
    /// 1. Device (instance, surface, GPU, queues)
    /// 2. Render pass + graphics pipeline
    /// 3. Swapchain (views, framebuffers, per-image semaphores)
    /// 4. Command pool + one command buffer per frame slot
    /// 5. Per-slot synchronization primitives
    pub fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let device = VulkanDevice::new(&config.window.title, config.validation_enabled(), &window)?;

        let format = choose_surface_format(&SwapchainSupport::query(&device)?.formats)?;
        let render_pass = pipeline::create_render_pass(&device, format.format)?;

        let pipeline = match GraphicsPipeline::new(
            &device,
            render_pass,
            &config.shaders.vertex,
            &config.shaders.fragment,
        ) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unsafe { device.device.destroy_render_pass(render_pass, None) };
                return Err(e);
            }
        };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_family()?)
            // Each slot's buffer is reset and re-recorded every frame
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        // Assemble early so Drop handles cleanup if anything below fails
        let mut renderer = Self {
            window,
            clear_color: math::color(config.graphics.clear_color),
            preferred_present_mode: config.present_mode(),
            frames: Vec::new(),
            command_buffers: Vec::new(),
            command_pool,
            swapchain: None,
            pipeline,
            render_pass,
            device,
        };

        let frames_in_flight = config.frames_in_flight();

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);
        renderer.command_buffers =
            unsafe { renderer.device.device.allocate_command_buffers(&alloc_info) }
                .context("Failed to allocate command buffers")?;

        for _ in 0..frames_in_flight {
            let frame = FrameSync::new(&renderer.device)?;
            renderer.frames.push(frame);
        }

        renderer.create_swapchain()?;

        log::info!(
            "Vulkan initialized successfully! ({} frames in flight)",
            frames_in_flight
        );
        Ok(renderer)
    }

    fn create_swapchain(&mut self) -> Result<usize> {
        // The surface allows one swapchain at a time
        self.swapchain = None;

        let swapchain = Swapchain::new(
            self.device.clone(),
            self.render_pass,
            drawable_extent(&self.window),
            self.preferred_present_mode,
        )?;
        let image_count = swapchain.image_count();
        self.swapchain = Some(swapchain);

        Ok(image_count)
    }

    pub fn image_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, Swapchain::image_count)
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain not initialized")
    }

    fn frame(&self, slot: usize) -> Result<&FrameSync> {
        self.frames
            .get(slot)
            .with_context(|| format!("No frame slot {}", slot))
    }
}

impl FrameTarget for Renderer {
    fn drawable_extent(&self) -> vk::Extent2D {
        drawable_extent(&self.window)
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.frame(slot)?.in_flight_fence;
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }
            .context("Failed waiting for in-flight fence")
    }

    fn acquire_image(&mut self, slot: usize) -> Result<Acquire> {
        let semaphore = self.frame(slot)?.image_available;
        self.swapchain()?.acquire_next_image(semaphore)
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.frame(slot)?.in_flight_fence;
        unsafe { self.device.device.reset_fences(&[fence]) }
            .context("Failed to reset in-flight fence")
    }

    /// Re-record the slot's command buffer to draw into `image_index`
    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let device = &self.device.device;
        let swapchain = self.swapchain()?;
        let cmd = *self
            .command_buffers
            .get(slot)
            .with_context(|| format!("No command buffer for slot {}", slot))?;
        let framebuffer = *swapchain
            .framebuffers
            .get(image_index as usize)
            .with_context(|| format!("No framebuffer for image {}", image_index))?;
        let extent = swapchain.extent;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color.to_array(),
            },
        }];

        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;

            let begin_info = vk::CommandBufferBeginInfo::builder();
            device
                .begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin recording command buffer")?;

            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(self.render_pass)
                .framebuffer(framebuffer)
                .render_area(pipeline::full_scissor(extent))
                .clear_values(&clear_values);

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.pipeline,
            );
            device.cmd_set_viewport(cmd, 0, &[pipeline::full_viewport(extent)]);
            device.cmd_set_scissor(cmd, 0, &[pipeline::full_scissor(extent)]);
            device.cmd_draw(cmd, 3, 1, 0, 0);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .context("Failed to record command buffer")?;
        }

        Ok(())
    }

    fn submit(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let frame = self.frame(slot)?;
        let render_finished = *self
            .swapchain()?
            .render_finished
            .get(image_index as usize)
            .with_context(|| format!("No render-finished semaphore for image {}", image_index))?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffers[slot]];
        let signal_semaphores = [render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                frame.in_flight_fence,
            )
        }
        .context("Failed to submit draw command buffer")
    }

    fn present(&mut self, image_index: u32) -> Result<PresentStatus> {
        let swapchain = self.swapchain()?;
        let render_finished = *swapchain
            .render_finished
            .get(image_index as usize)
            .with_context(|| format!("No render-finished semaphore for image {}", image_index))?;

        swapchain.present(self.device.present_queue, image_index, &[render_finished])
    }

    /// Recreate swapchain after a resize or when it went stale.
    ///
    /// Waits for the GPU first: nothing may still reference the old images.
    fn recreate_swapchain(&mut self) -> Result<usize> {
        self.device.wait_idle()?;

        let image_count = self.create_swapchain()?;
        let extent = self.swapchain()?.extent;
        log::info!(
            "Swapchain recreated: {}x{}, {} images",
            extent.width,
            extent.height,
            image_count
        );
        Ok(image_count)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        let _ = self.device.wait_idle();

        unsafe {
            let device = &self.device.device;

            for frame in &self.frames {
                frame.destroy(device);
            }

            // Also frees the command buffers
            device.destroy_command_pool(self.command_pool, None);
        }

        self.swapchain = None;

        self.pipeline.destroy(&self.device.device);
        unsafe {
            self.device.device.destroy_render_pass(self.render_pass, None);
        }

        log::info!("Cleanup complete");
    }
}
