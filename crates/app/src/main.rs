//! Forge example application.
//!
//! Renders a full-screen-less classic: clear to blue, draw one triangle
//! through the render graph, present. Escape quits, F11 toggles fullscreen.

use anyhow::Result;
use tracing::info;

use forge_engine::{render_frame, Application, Engine, Services};
use forge_gfx::pipeline::{GraphicsPipelineBuilder, Pipeline};
use forge_gfx::vk;
use forge_graph::RenderGraph;
use forge_platform::KeyCode;

#[derive(Default)]
struct Example {
    pipeline: Option<Pipeline>,
}

impl Application for Example {
    fn should_close(&mut self, services: &Services) -> bool {
        services.platform.window().should_close()
            || services.platform.input().is_key_pressed(KeyCode::Escape)
    }

    fn on_init(&mut self, services: &mut Services) -> Result<()> {
        let color_format = services.context.swapchain().format();

        let mut resources = services.context.pipeline_resources();
        resources.shader_modules.load("triangle.vert.spv")?;
        resources.shader_modules.load("triangle.frag.spv")?;
        let vert = resources
            .shader_modules
            .find("triangle.vert.spv")
            .expect("loaded above");
        let frag = resources
            .shader_modules
            .find("triangle.frag.spv")
            .expect("loaded above");

        let pipeline = GraphicsPipelineBuilder::new(
            resources.device.clone(),
            resources.pipeline_cache,
            resources.pipeline_layouts,
            resources.set_layouts,
        )
        .shader_stage(vert)
        .shader_stage(frag)
        .resource_descriptor_heap(0, resources.buffer_heap)
        .rasterization(
            vk::PipelineRasterizationStateCreateInfo::default()
                .polygon_mode(vk::PolygonMode::FILL)
                .cull_mode(vk::CullModeFlags::NONE)
                .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
                .line_width(1.0),
        )
        .color_attachment(
            color_format,
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA),
        )
        .dynamic_state(vk::DynamicState::VIEWPORT)
        .dynamic_state(vk::DynamicState::SCISSOR)
        .build()?;
        self.pipeline = Some(pipeline);

        // Push any staged resources and descriptor writes to the device
        // before the first frame references them.
        services.context.flush()?;

        info!("Example initialized");
        Ok(())
    }

    fn on_terminate(&mut self, _services: &mut Services) {
        self.pipeline = None;
    }

    fn on_render(&mut self, services: &mut Services, _alpha: f64) -> Result<()> {
        if services.platform.input().is_key_just_pressed(KeyCode::F11) {
            let window = services.platform.window();
            window.set_fullscreen(!window.is_fullscreen());
        }

        let pipeline = self.pipeline.as_ref().expect("created in on_init");

        render_frame(
            services,
            |_services| Ok(()),
            |services| {
                let swapchain = services.context.swapchain();
                let extent = swapchain.extent();
                let image = swapchain.current_image();
                let view = swapchain.current_image_view();

                let mut graph = RenderGraph::new();
                let target = graph.import_image(
                    "swapchain",
                    image,
                    view,
                    vk::ImageAspectFlags::COLOR,
                    vk::ImageLayout::UNDEFINED,
                    Some(vk::ImageLayout::PRESENT_SRC_KHR),
                );

                graph.add_pass(
                    "forward",
                    vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                    false,
                    |builder| {
                        builder.write(target, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
                    },
                    move |ctx| {
                        let device = ctx.device().clone();
                        let cmd = ctx.cmd;

                        let color_attachment = vk::RenderingAttachmentInfo::default()
                            .image_view(ctx.resources.image_view(target))
                            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                            .load_op(vk::AttachmentLoadOp::CLEAR)
                            .store_op(vk::AttachmentStoreOp::STORE)
                            .clear_value(vk::ClearValue {
                                color: vk::ClearColorValue {
                                    float32: [0.0, 0.0, 1.0, 0.0],
                                },
                            });
                        let color_attachments = [color_attachment];
                        let rendering_info = vk::RenderingInfo::default()
                            .render_area(vk::Rect2D {
                                offset: vk::Offset2D::default(),
                                extent,
                            })
                            .layer_count(1)
                            .color_attachments(&color_attachments);

                        unsafe {
                            device.handle().cmd_begin_rendering(cmd, &rendering_info);

                            pipeline.bind(cmd);
                            device.handle().cmd_set_viewport(
                                cmd,
                                0,
                                &[vk::Viewport {
                                    x: 0.0,
                                    y: 0.0,
                                    width: extent.width as f32,
                                    height: extent.height as f32,
                                    min_depth: 0.0,
                                    max_depth: 1.0,
                                }],
                            );
                            device.handle().cmd_set_scissor(
                                cmd,
                                0,
                                &[vk::Rect2D {
                                    offset: vk::Offset2D::default(),
                                    extent,
                                }],
                            );
                            device.handle().cmd_draw(cmd, 3, 1, 0, 0);

                            device.handle().cmd_end_rendering(cmd);
                        }
                        Ok(())
                    },
                );

                let allocator = services.context.allocator().clone();
                graph.compile(&allocator)?;
                graph.execute(services.context.current_frame_mut())?;
                Ok(())
            },
        )?;

        Ok(())
    }
}

fn main() -> Result<()> {
    forge_core::init_logging();
    info!("Starting Forge example");

    let mut services = Engine::init("Forge", 1280, 720)?;
    let mut app = Example::default();
    let result = forge_engine::run(&mut app, &mut services, 30);
    Engine::terminate(services)?;
    result
}
