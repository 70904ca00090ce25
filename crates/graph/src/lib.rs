//! Render graph for the Forge render runtime.
//!
//! A [`RenderGraph`] is rebuilt every frame: passes declare the resources
//! they create, read, and write; [`RenderGraph::compile`] prunes passes
//! nothing observes, orders the rest topologically, places transient
//! resources in aliased memory, and assigns synchronization2 barriers;
//! [`RenderGraph::execute`] records one command buffer for the frame,
//! emitting each pass's pre-barriers before invoking its callback.
//!
//! ```no_run
//! # use forge_graph::*;
//! # use forge_gfx::vk;
//! # fn demo(graph: &mut RenderGraph, image: vk::Image, view: vk::ImageView) {
//! let target = graph.import_image(
//!     "swapchain",
//!     image,
//!     view,
//!     vk::ImageAspectFlags::COLOR,
//!     vk::ImageLayout::UNDEFINED,
//!     Some(vk::ImageLayout::PRESENT_SRC_KHR),
//! );
//! graph.add_pass(
//!     "forward",
//!     vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
//!     false,
//!     |builder| {
//!         builder.write(target, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
//!     },
//!     move |_ctx| {
//!         // begin rendering, draw, end rendering
//!         Ok(())
//!     },
//! );
//! # }
//! ```

mod physical;
mod plan;

use ash::vk;
use std::sync::Arc;
use tracing::debug;

use forge_gfx::allocator::GpuAllocator;
use forge_gfx::device::Device;
use forge_gfx::frame::Frame;
use forge_gfx::{GfxError, GfxResult};

use physical::PhysicalResources;
use plan::{Plan, PlanAccess, PlanInput, PlanPass, PlanResource};

/// Stable identifier of a pass within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(u32);

/// Stable identifier of a resource within one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u32);

/// Description of a transient buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

/// Description of a transient 2D image.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

pub(crate) enum ResourceKind {
    TransientBuffer(BufferDesc),
    TransientImage(ImageDesc),
    ImportedBuffer {
        buffer: vk::Buffer,
    },
    ImportedImage {
        image: vk::Image,
        view: vk::ImageView,
        aspect: vk::ImageAspectFlags,
        initial_layout: vk::ImageLayout,
        final_layout: Option<vk::ImageLayout>,
    },
}

pub(crate) struct ResourceNode {
    name: String,
    pub(crate) kind: ResourceKind,
    /// Bumped by every write declaration.
    version: u32,
    creator: Option<PassId>,
}

type ExecuteFn<'a> = Box<dyn FnMut(&mut PassContext<'_>) -> GfxResult<()> + 'a>;

struct PassNode<'a> {
    name: String,
    stage_mask: vk::PipelineStageFlags2,
    has_side_effects: bool,
    creates: Vec<(ResourceId, vk::AccessFlags2)>,
    reads: Vec<(ResourceId, vk::AccessFlags2)>,
    writes: Vec<(ResourceId, vk::AccessFlags2)>,
    execute: ExecuteFn<'a>,
}

struct Compiled {
    plan: Plan,
    physical: PhysicalResources,
}

/// A frame's pass/resource DAG.
pub struct RenderGraph<'a> {
    passes: Vec<PassNode<'a>>,
    resources: Vec<ResourceNode>,
    compiled: Option<Compiled>,
}

impl<'a> RenderGraph<'a> {
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            resources: Vec::new(),
            compiled: None,
        }
    }

    /// Imports an externally owned buffer (retained resource).
    pub fn import_buffer(&mut self, name: &str, buffer: vk::Buffer) -> ResourceId {
        self.push_resource(ResourceNode {
            name: name.to_owned(),
            kind: ResourceKind::ImportedBuffer { buffer },
            version: 0,
            creator: None,
        })
    }

    /// Imports an externally owned image (retained resource).
    ///
    /// `initial_layout` is the layout the image enters the frame in;
    /// `final_layout`, when set, is the layout an external consumer expects
    /// after the graph's last use (PRESENT_SRC_KHR for the swapchain
    /// image). Imported resources are externally observable, so writes to
    /// them keep their writers live.
    pub fn import_image(
        &mut self,
        name: &str,
        image: vk::Image,
        view: vk::ImageView,
        aspect: vk::ImageAspectFlags,
        initial_layout: vk::ImageLayout,
        final_layout: Option<vk::ImageLayout>,
    ) -> ResourceId {
        self.push_resource(ResourceNode {
            name: name.to_owned(),
            kind: ResourceKind::ImportedImage {
                image,
                view,
                aspect,
                initial_layout,
                final_layout,
            },
            version: 0,
            creator: None,
        })
    }

    /// Adds a pass.
    ///
    /// `setup` runs immediately and declares the pass's resource edges
    /// through the [`PassBuilder`]; `execute` is invoked during
    /// [`RenderGraph::execute`] with the pass's pre-barriers already
    /// recorded.
    pub fn add_pass<S, E>(
        &mut self,
        name: &str,
        stage_mask: vk::PipelineStageFlags2,
        has_side_effects: bool,
        setup: S,
        execute: E,
    ) -> PassId
    where
        S: FnOnce(&mut PassBuilder<'_, 'a>),
        E: FnMut(&mut PassContext<'_>) -> GfxResult<()> + 'a,
    {
        let id = PassId(self.passes.len() as u32);
        self.passes.push(PassNode {
            name: name.to_owned(),
            stage_mask,
            has_side_effects,
            creates: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            execute: Box::new(execute),
        });
        let mut builder = PassBuilder { graph: self, pass: id };
        setup(&mut builder);
        id
    }

    /// Compiles the graph: culling, ordering, transient placement, barrier
    /// assignment.
    ///
    /// # Errors
    ///
    /// [`GfxError::RenderGraphUnresolvedResource`] for reads with no
    /// producer, [`GfxError::RenderGraphCycle`] for cyclic dependencies.
    pub fn compile(&mut self, allocator: &Arc<GpuAllocator>) -> GfxResult<()> {
        let input = self.plan_input()?;
        let plan = plan::compile(&input).map_err(|e| match e {
            plan::PlanError::Cycle => GfxError::RenderGraphCycle,
        })?;
        let physical = physical::realize(allocator, &self.resources, &plan)?;
        self.compiled = Some(Compiled { plan, physical });
        Ok(())
    }

    /// Records the frame's command buffer: profiler collect scope, then per
    /// live pass its pre-barriers and callback, then the external hand-off
    /// barriers.
    ///
    /// The caller submits the frame afterwards.
    pub fn execute(&mut self, frame: &mut Frame) -> GfxResult<()> {
        let compiled = self
            .compiled
            .as_ref()
            .expect("compile() must run before execute()");
        let device = frame.device().clone();
        let cmd = frame.command_buffer();

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.handle().begin_command_buffer(cmd, &begin_info)? };

        for (pos, &pass_index) in compiled.plan.order.iter().enumerate() {
            record_barriers(
                &device,
                cmd,
                &compiled.plan.barriers[pos],
                &self.resources,
                &compiled.physical,
            );

            let pass = &mut self.passes[pass_index];
            let scope = frame.profiler().begin_scope(cmd, &pass.name);
            {
                let mut ctx = PassContext {
                    cmd,
                    frame: &mut *frame,
                    resources: ResourceTable {
                        resources: &self.resources,
                        physical: &compiled.physical,
                    },
                };
                (pass.execute)(&mut ctx)?;
            }
            if let Some(scope) = scope {
                frame.profiler().end_scope(cmd, scope);
            }
        }

        record_barriers(
            &device,
            cmd,
            &compiled.plan.final_barriers,
            &self.resources,
            &compiled.physical,
        );

        unsafe { device.handle().end_command_buffer(cmd)? };
        Ok(())
    }

    /// Runs culling and ordering without touching the device.
    ///
    /// Returns the live passes in execution order. [`RenderGraph::compile`]
    /// performs the same analysis and additionally realizes transient
    /// resources.
    pub fn schedule(&self) -> GfxResult<Vec<PassId>> {
        let input = self.plan_input()?;
        let plan = plan::compile(&input).map_err(|e| match e {
            plan::PlanError::Cycle => GfxError::RenderGraphCycle,
        })?;
        Ok(plan.order.iter().map(|&index| PassId(index as u32)).collect())
    }

    /// The current version of a resource (bumped per declared write).
    pub fn resource_version(&self, id: ResourceId) -> u32 {
        self.resources[id.0 as usize].version
    }

    /// Logs the compiled schedule under the `graph` target.
    pub fn dump(&self) {
        let Some(compiled) = &self.compiled else {
            debug!(target: "graph", "graph not compiled");
            return;
        };
        for (pos, &pass) in compiled.plan.order.iter().enumerate() {
            debug!(
                target: "graph",
                "#{} {} ({} barriers)",
                pos,
                self.passes[pass].name,
                compiled.plan.barriers[pos].len()
            );
        }
        let culled = compiled.plan.live.iter().filter(|&&live| !live).count();
        debug!(
            target: "graph",
            "{} final barrier(s), {} transient resource(s), {} pass(es) culled",
            compiled.plan.final_barriers.len(),
            compiled.plan.live_intervals.len(),
            culled
        );
    }

    /// Number of passes that survived culling. Compile first.
    pub fn live_pass_count(&self) -> usize {
        self.compiled
            .as_ref()
            .map_or(0, |compiled| compiled.plan.order.len())
    }

    fn push_resource(&mut self, node: ResourceNode) -> ResourceId {
        let id = ResourceId(self.resources.len() as u32);
        self.resources.push(node);
        id
    }

    /// Builds the pure planner's input from the declared edges.
    fn plan_input(&self) -> GfxResult<PlanInput> {
        let mut histories: Vec<Vec<PlanAccess>> = vec![Vec::new(); self.resources.len()];

        for (pass_index, pass) in self.passes.iter().enumerate() {
            let mut record =
                |edges: &[(ResourceId, vk::AccessFlags2)], is_write: bool| -> GfxResult<()> {
                    for &(id, access) in edges {
                        let slot = histories.get_mut(id.0 as usize).ok_or_else(|| {
                            GfxError::RenderGraphUnresolvedResource(format!(
                                "pass '{}' references foreign resource id {}",
                                pass.name, id.0
                            ))
                        })?;
                        slot.push(PlanAccess {
                            pass: pass_index,
                            access,
                            is_write,
                        });
                    }
                    Ok(())
                };
            record(&pass.creates, true)?;
            record(&pass.reads, false)?;
            record(&pass.writes, true)?;
        }

        // A transient read with no prior write has no defined producer.
        for (id, history) in histories.iter().enumerate() {
            if self.resources[id].creator.is_none() {
                continue;
            }
            let mut written = false;
            for entry in history {
                if entry.is_write {
                    written = true;
                } else if !written {
                    return Err(GfxError::RenderGraphUnresolvedResource(
                        self.resources[id].name.clone(),
                    ));
                }
            }
        }

        let passes = self
            .passes
            .iter()
            .map(|pass| PlanPass {
                stage_mask: pass.stage_mask,
                side_effects: pass.has_side_effects,
            })
            .collect();

        let resources = self
            .resources
            .iter()
            .zip(histories)
            .map(|(resource, history)| {
                let (image, initial_layout, final_layout) = match &resource.kind {
                    ResourceKind::TransientBuffer(_) | ResourceKind::ImportedBuffer { .. } => {
                        (false, vk::ImageLayout::UNDEFINED, None)
                    }
                    ResourceKind::TransientImage(_) => (true, vk::ImageLayout::UNDEFINED, None),
                    ResourceKind::ImportedImage {
                        initial_layout,
                        final_layout,
                        ..
                    } => (true, *initial_layout, *final_layout),
                };
                PlanResource {
                    history,
                    transient: resource.creator.is_some(),
                    image,
                    initial_layout,
                    final_layout,
                    external: resource.creator.is_none(),
                }
            })
            .collect();

        Ok(PlanInput { passes, resources })
    }
}

impl Default for RenderGraph<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Declares a pass's resource edges during setup.
pub struct PassBuilder<'g, 'a> {
    graph: &'g mut RenderGraph<'a>,
    pass: PassId,
}

impl PassBuilder<'_, '_> {
    /// Creates a transient buffer owned by this pass, with a first write.
    pub fn create_buffer(
        &mut self,
        name: &str,
        desc: BufferDesc,
        access: vk::AccessFlags2,
    ) -> ResourceId {
        let id = self.graph.push_resource(ResourceNode {
            name: name.to_owned(),
            kind: ResourceKind::TransientBuffer(desc),
            version: 0,
            creator: Some(self.pass),
        });
        self.graph.passes[self.pass.0 as usize]
            .creates
            .push((id, access));
        id
    }

    /// Creates a transient image owned by this pass, with a first write.
    pub fn create_image(
        &mut self,
        name: &str,
        desc: ImageDesc,
        access: vk::AccessFlags2,
    ) -> ResourceId {
        let id = self.graph.push_resource(ResourceNode {
            name: name.to_owned(),
            kind: ResourceKind::TransientImage(desc),
            version: 0,
            creator: Some(self.pass),
        });
        self.graph.passes[self.pass.0 as usize]
            .creates
            .push((id, access));
        id
    }

    /// Declares a read of the resource's current version.
    pub fn read(&mut self, id: ResourceId, access: vk::AccessFlags2) {
        self.graph.passes[self.pass.0 as usize]
            .reads
            .push((id, access));
    }

    /// Declares a write, bumping the resource's version.
    pub fn write(&mut self, id: ResourceId, access: vk::AccessFlags2) {
        if let Some(resource) = self.graph.resources.get_mut(id.0 as usize) {
            resource.version += 1;
        }
        self.graph.passes[self.pass.0 as usize]
            .writes
            .push((id, access));
    }
}

/// Resolves graph resource ids to physical handles during execution.
pub struct ResourceTable<'x> {
    resources: &'x [ResourceNode],
    physical: &'x PhysicalResources,
}

impl ResourceTable<'_> {
    /// The Vulkan buffer backing `id`.
    pub fn buffer(&self, id: ResourceId) -> vk::Buffer {
        match &self.resources[id.0 as usize].kind {
            ResourceKind::ImportedBuffer { buffer } => *buffer,
            ResourceKind::TransientBuffer(_) => self.physical.buffers[&(id.0 as usize)],
            _ => panic!("resource '{}' is not a buffer", self.resources[id.0 as usize].name),
        }
    }

    /// The Vulkan image backing `id`.
    pub fn image(&self, id: ResourceId) -> vk::Image {
        match &self.resources[id.0 as usize].kind {
            ResourceKind::ImportedImage { image, .. } => *image,
            ResourceKind::TransientImage(_) => self.physical.images[&(id.0 as usize)].image,
            _ => panic!("resource '{}' is not an image", self.resources[id.0 as usize].name),
        }
    }

    /// The image view backing `id`.
    pub fn image_view(&self, id: ResourceId) -> vk::ImageView {
        match &self.resources[id.0 as usize].kind {
            ResourceKind::ImportedImage { view, .. } => *view,
            ResourceKind::TransientImage(_) => self.physical.images[&(id.0 as usize)].view,
            _ => panic!("resource '{}' is not an image", self.resources[id.0 as usize].name),
        }
    }
}

/// Per-pass execution context: the frame's command buffer plus resource
/// resolution.
pub struct PassContext<'x> {
    pub cmd: vk::CommandBuffer,
    pub frame: &'x mut Frame,
    pub resources: ResourceTable<'x>,
}

impl PassContext<'_> {
    /// The device the pass records against.
    pub fn device(&self) -> &Arc<Device> {
        self.frame.device()
    }
}

/// Records one `vkCmdPipelineBarrier2` covering `barriers`.
fn record_barriers(
    device: &Arc<Device>,
    cmd: vk::CommandBuffer,
    barriers: &[plan::Barrier],
    resources: &[ResourceNode],
    physical: &PhysicalResources,
) {
    if barriers.is_empty() {
        return;
    }

    let mut image_barriers = Vec::new();
    let mut buffer_barriers = Vec::new();

    for barrier in barriers {
        match &resources[barrier.resource].kind {
            ResourceKind::ImportedImage { image, aspect, .. } => {
                image_barriers.push(image_barrier(barrier, *image, *aspect));
            }
            ResourceKind::TransientImage(desc) => {
                let image = physical.images[&barrier.resource].image;
                image_barriers.push(image_barrier(barrier, image, desc.aspect));
            }
            ResourceKind::ImportedBuffer { buffer } => {
                buffer_barriers.push(buffer_barrier(barrier, *buffer));
            }
            ResourceKind::TransientBuffer(_) => {
                let buffer = physical.buffers[&barrier.resource];
                buffer_barriers.push(buffer_barrier(barrier, buffer));
            }
        }
    }

    let dependency = vk::DependencyInfo::default()
        .image_memory_barriers(&image_barriers)
        .buffer_memory_barriers(&buffer_barriers);
    unsafe { device.handle().cmd_pipeline_barrier2(cmd, &dependency) };
}

fn image_barrier(
    barrier: &plan::Barrier,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(barrier.src_stage)
        .src_access_mask(barrier.src_access)
        .dst_stage_mask(barrier.dst_stage)
        .dst_access_mask(barrier.dst_access)
        .old_layout(barrier.old_layout)
        .new_layout(barrier.new_layout)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(0)
                .level_count(vk::REMAINING_MIP_LEVELS)
                .base_array_layer(0)
                .layer_count(vk::REMAINING_ARRAY_LAYERS),
        )
}

fn buffer_barrier(barrier: &plan::Barrier, buffer: vk::Buffer) -> vk::BufferMemoryBarrier2<'static> {
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(barrier.src_stage)
        .src_access_mask(barrier.src_access)
        .dst_stage_mask(barrier.dst_stage)
        .dst_access_mask(barrier.dst_access)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}
