//! Pipeline construction and caching.
//!
//! [`PipelineCache`] wraps the driver pipeline cache and persists its blob
//! to `./shader_cache.bin` across runs. The graphics and compute builders
//! derive their pipeline layout from the union of the attached shaders'
//! reflection, attach bindless heaps by set index, and create pipelines with
//! dynamic rendering (attachment formats via `PipelineRenderingCreateInfo`,
//! no render passes or framebuffers).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use tracing::{info, warn};

use crate::cache::{
    DescriptorSetLayoutCache, DescriptorSetLayoutKey, LayoutBinding, PipelineLayoutCache,
    PipelineLayoutKey, PushConstantRange,
};
use crate::device::Device;
use crate::error::{GfxError, GfxResult};
use crate::heap::ResourceDescriptorHeap;
use crate::shaders::ShaderModule;

/// On-disk pipeline cache blob location.
const CACHE_FILE: &str = "shader_cache.bin";

/// Driver pipeline cache with an on-disk blob.
pub struct PipelineCache {
    device: Arc<Device>,
    cache: vk::PipelineCache,
    path: PathBuf,
}

impl PipelineCache {
    /// Creates the cache, seeding it from `./shader_cache.bin` when present.
    ///
    /// A missing or corrupt blob is non-fatal; the cache starts empty.
    pub fn new(device: Arc<Device>) -> GfxResult<Self> {
        let path = PathBuf::from(CACHE_FILE);
        let blob = std::fs::read(&path).unwrap_or_default();
        if !blob.is_empty() {
            info!(target: "gfx", "Loading shader cache from {}", path.display());
        }

        let create_info = vk::PipelineCacheCreateInfo::default().initial_data(&blob);
        let cache = match unsafe { device.handle().create_pipeline_cache(&create_info, None) } {
            Ok(cache) => cache,
            Err(_) => {
                // Corrupt blob; fall back to an empty cache.
                warn!(target: "gfx", "Discarding unusable shader cache blob");
                let empty = vk::PipelineCacheCreateInfo::default();
                unsafe { device.handle().create_pipeline_cache(&empty, None)? }
            }
        };

        Ok(Self {
            device,
            cache,
            path,
        })
    }

    /// Writes the driver blob to disk. Called once on teardown.
    pub fn save(&self) -> GfxResult<()> {
        let data = unsafe { self.device.handle().get_pipeline_cache_data(self.cache)? };
        info!(target: "gfx", "Saving shader cache to {}", self.path.display());
        std::fs::write(&self.path, data)?;
        Ok(())
    }

    /// Creates a graphics pipeline through the cache.
    ///
    /// Non-success results are logged; the pipeline is still returned when
    /// the driver produced one.
    pub fn create_graphics(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo,
    ) -> GfxResult<vk::Pipeline> {
        let result = unsafe {
            self.device.handle().create_graphics_pipelines(
                self.cache,
                std::slice::from_ref(create_info),
                None,
            )
        };
        Self::unwrap_pipeline(result)
    }

    /// Creates a compute pipeline through the cache.
    pub fn create_compute(
        &self,
        create_info: &vk::ComputePipelineCreateInfo,
    ) -> GfxResult<vk::Pipeline> {
        let result = unsafe {
            self.device.handle().create_compute_pipelines(
                self.cache,
                std::slice::from_ref(create_info),
                None,
            )
        };
        Self::unwrap_pipeline(result)
    }

    fn unwrap_pipeline(
        result: Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)>,
    ) -> GfxResult<vk::Pipeline> {
        match result {
            Ok(pipelines) => Ok(pipelines[0]),
            Err((pipelines, e)) => {
                warn!(target: "gfx", "Pipeline creation returned {:?}", e);
                match pipelines.first() {
                    Some(&pipeline) if pipeline != vk::Pipeline::null() => Ok(pipeline),
                    _ => Err(GfxError::PipelineCreationFailed(e)),
                }
            }
        }
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_pipeline_cache(self.cache, None);
        }
    }
}

/// A built pipeline with its layout and attached bindless heaps.
pub struct Pipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    /// Attached heaps as `(set index, descriptor set)`, ascending.
    heaps: Vec<(u32, vk::DescriptorSet)>,
}

impl Pipeline {
    /// Returns the pipeline handle.
    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Returns the pipeline layout (owned by the layout cache).
    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Binds the pipeline, then each attached heap set at its set index.
    pub fn bind(&self, cmd: vk::CommandBuffer) {
        let device = self.device.handle();
        unsafe {
            device.cmd_bind_pipeline(cmd, self.bind_point, self.pipeline);
            for &(set_index, set) in &self.heaps {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    self.bind_point,
                    self.layout,
                    set_index,
                    &[set],
                    &[],
                );
            }
        }
    }

    /// Binds additional descriptor sets starting at `first_set`.
    pub fn bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device.handle().cmd_bind_descriptor_sets(
                cmd,
                self.bind_point,
                self.layout,
                first_set,
                sets,
                dynamic_offsets,
            );
        }
    }

    /// Pushes constants through the pipeline's layout.
    pub fn push(
        &self,
        cmd: vk::CommandBuffer,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .handle()
                .cmd_push_constants(cmd, self.layout, stages, offset, data);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().destroy_pipeline(self.pipeline, None);
        }
    }
}

/// Merges per-set binding lists reflected from several shader stages.
///
/// The resulting lists still contain duplicates across stages; the layout
/// cache's canonicalization merges those (OR-ing stage flags) before
/// hashing.
fn merge_set_bindings(stages: &[&ShaderModule]) -> BTreeMap<u32, Vec<LayoutBinding>> {
    let mut merged: BTreeMap<u32, Vec<LayoutBinding>> = BTreeMap::new();
    for shader in stages {
        for (set, bindings) in shader.descriptor_sets() {
            merged.entry(*set).or_default().extend_from_slice(bindings);
        }
    }
    merged
}

/// Merges push-constant ranges collected across stages: ranges with equal
/// `(offset, size)` collapse to one entry with OR-ed stage flags.
pub fn merge_push_constant_ranges(ranges: &[PushConstantRange]) -> Vec<PushConstantRange> {
    let mut merged: Vec<PushConstantRange> = Vec::new();
    for range in ranges {
        if let Some(existing) = merged
            .iter_mut()
            .find(|r| r.offset == range.offset && r.size == range.size)
        {
            existing.stages |= range.stages;
        } else {
            merged.push(*range);
        }
    }
    merged
}

/// Derives the pipeline layout for a set of shader stages plus attached
/// heaps, going through the layout caches.
fn build_layout(
    descriptor_set_layout_cache: &mut DescriptorSetLayoutCache,
    pipeline_layout_cache: &mut PipelineLayoutCache,
    stages: &[&ShaderModule],
    heap_layouts: &BTreeMap<u32, vk::DescriptorSetLayout>,
) -> GfxResult<vk::PipelineLayout> {
    let reflected = merge_set_bindings(stages);

    let num_sets = reflected
        .keys()
        .chain(heap_layouts.keys())
        .max()
        .map_or(0, |&max| max + 1);

    let mut set_layouts = Vec::with_capacity(num_sets as usize);
    for set in 0..num_sets {
        // An attached heap owns its set index outright; reflection of the
        // runtime-sized array would under-describe it.
        if let Some(&layout) = heap_layouts.get(&set) {
            set_layouts.push(layout);
            continue;
        }
        let bindings = reflected.get(&set).cloned().unwrap_or_default();
        let layout = descriptor_set_layout_cache.get(DescriptorSetLayoutKey {
            flags: vk::DescriptorSetLayoutCreateFlags::empty(),
            bindings,
        })?;
        set_layouts.push(layout);
    }

    let ranges: Vec<PushConstantRange> = stages
        .iter()
        .filter_map(|shader| shader.push_constant_range())
        .collect();
    let push_constant_ranges = merge_push_constant_ranges(&ranges);

    pipeline_layout_cache.get(PipelineLayoutKey {
        set_layouts,
        push_constant_ranges,
    })
}

/// Builder for graphics pipelines (dynamic rendering).
pub struct GraphicsPipelineBuilder<'a> {
    device: Arc<Device>,
    pipeline_cache: &'a PipelineCache,
    pipeline_layout_cache: &'a mut PipelineLayoutCache,
    descriptor_set_layout_cache: &'a mut DescriptorSetLayoutCache,

    shader_stages: Vec<&'a ShaderModule>,
    heaps: BTreeMap<u32, (vk::DescriptorSet, vk::DescriptorSetLayout)>,

    vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    vertex_attributes: Vec<vk::VertexInputAttributeDescription>,

    input_assembly: vk::PipelineInputAssemblyStateCreateInfo<'a>,
    tessellation: vk::PipelineTessellationStateCreateInfo<'a>,

    viewports: Vec<vk::Viewport>,
    scissors: Vec<vk::Rect2D>,

    rasterization: vk::PipelineRasterizationStateCreateInfo<'a>,
    multisample: vk::PipelineMultisampleStateCreateInfo<'a>,
    depth_stencil: vk::PipelineDepthStencilStateCreateInfo<'a>,

    logic_op_enable: bool,
    logic_op: vk::LogicOp,
    blend_constants: [f32; 4],
    blend_states: Vec<vk::PipelineColorBlendAttachmentState>,

    dynamic_states: Vec<vk::DynamicState>,

    color_formats: Vec<vk::Format>,
    depth_format: vk::Format,
    stencil_format: vk::Format,
}

impl<'a> GraphicsPipelineBuilder<'a> {
    pub fn new(
        device: Arc<Device>,
        pipeline_cache: &'a PipelineCache,
        pipeline_layout_cache: &'a mut PipelineLayoutCache,
        descriptor_set_layout_cache: &'a mut DescriptorSetLayoutCache,
    ) -> Self {
        Self {
            device,
            pipeline_cache,
            pipeline_layout_cache,
            descriptor_set_layout_cache,
            shader_stages: Vec::new(),
            heaps: BTreeMap::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            input_assembly: vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(vk::PrimitiveTopology::TRIANGLE_LIST),
            tessellation: vk::PipelineTessellationStateCreateInfo::default(),
            viewports: Vec::new(),
            scissors: Vec::new(),
            rasterization: vk::PipelineRasterizationStateCreateInfo::default().line_width(1.0),
            multisample: vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(vk::SampleCountFlags::TYPE_1),
            depth_stencil: vk::PipelineDepthStencilStateCreateInfo::default(),
            logic_op_enable: false,
            logic_op: vk::LogicOp::CLEAR,
            blend_constants: [0.0; 4],
            blend_states: Vec::new(),
            dynamic_states: Vec::new(),
            color_formats: Vec::new(),
            depth_format: vk::Format::UNDEFINED,
            stencil_format: vk::Format::UNDEFINED,
        }
    }

    /// Adds a shader stage; its reflection feeds the pipeline layout.
    pub fn shader_stage(mut self, shader: &'a ShaderModule) -> Self {
        debug_assert!(shader.stage() != vk::ShaderStageFlags::COMPUTE);
        self.shader_stages.push(shader);
        self
    }

    /// Attaches a bindless heap at `set_index`; [`Pipeline::bind`] will bind
    /// its set there.
    pub fn resource_descriptor_heap(
        mut self,
        set_index: u32,
        heap: &ResourceDescriptorHeap,
    ) -> Self {
        self.heaps.insert(set_index, (heap.set(), heap.layout()));
        self
    }

    pub fn vertex_binding(mut self, binding: vk::VertexInputBindingDescription) -> Self {
        self.vertex_bindings.push(binding);
        self
    }

    pub fn vertex_attribute(mut self, attribute: vk::VertexInputAttributeDescription) -> Self {
        self.vertex_attributes.push(attribute);
        self
    }

    pub fn input_assembly(mut self, state: vk::PipelineInputAssemblyStateCreateInfo<'a>) -> Self {
        self.input_assembly = state;
        self
    }

    pub fn tessellation(mut self, state: vk::PipelineTessellationStateCreateInfo<'a>) -> Self {
        self.tessellation = state;
        self
    }

    pub fn viewport(mut self, viewport: vk::Viewport) -> Self {
        self.viewports.push(viewport);
        self
    }

    pub fn scissor(mut self, scissor: vk::Rect2D) -> Self {
        self.scissors.push(scissor);
        self
    }

    pub fn rasterization(mut self, state: vk::PipelineRasterizationStateCreateInfo<'a>) -> Self {
        self.rasterization = state;
        self
    }

    pub fn multisample(mut self, state: vk::PipelineMultisampleStateCreateInfo<'a>) -> Self {
        self.multisample = state;
        self
    }

    pub fn depth_stencil(mut self, state: vk::PipelineDepthStencilStateCreateInfo<'a>) -> Self {
        self.depth_stencil = state;
        self
    }

    pub fn color_blend(
        mut self,
        logic_op_enable: bool,
        logic_op: vk::LogicOp,
        blend_constants: [f32; 4],
    ) -> Self {
        self.logic_op_enable = logic_op_enable;
        self.logic_op = logic_op;
        self.blend_constants = blend_constants;
        self
    }

    pub fn dynamic_state(mut self, state: vk::DynamicState) -> Self {
        if !self.dynamic_states.contains(&state) {
            self.dynamic_states.push(state);
        }
        self
    }

    /// Declares a color attachment format and its blend state.
    pub fn color_attachment(
        mut self,
        format: vk::Format,
        blend_state: vk::PipelineColorBlendAttachmentState,
    ) -> Self {
        self.color_formats.push(format);
        self.blend_states.push(blend_state);
        self
    }

    pub fn depth_attachment(mut self, format: vk::Format) -> Self {
        self.depth_format = format;
        self
    }

    pub fn stencil_attachment(mut self, format: vk::Format) -> Self {
        self.stencil_format = format;
        self
    }

    /// Builds the pipeline.
    ///
    /// Derives the layout from the attached shaders' reflection (heaps
    /// override their set indices), then creates the pipeline against the
    /// disk-backed cache with a `PipelineRenderingCreateInfo` describing the
    /// attachment formats.
    pub fn build(mut self) -> GfxResult<Pipeline> {
        let heap_layouts: BTreeMap<u32, vk::DescriptorSetLayout> = self
            .heaps
            .iter()
            .map(|(&set, &(_, layout))| (set, layout))
            .collect();
        let layout = build_layout(
            self.descriptor_set_layout_cache,
            self.pipeline_layout_cache,
            &self.shader_stages,
            &heap_layouts,
        )?;

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = self
            .shader_stages
            .iter()
            .map(|shader| shader.stage_create_info())
            .collect();

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&self.vertex_bindings)
            .vertex_attribute_descriptions(&self.vertex_attributes);

        // Dynamic viewport/scissor still need one (ignored) entry each.
        if self.dynamic_states.contains(&vk::DynamicState::VIEWPORT) && self.viewports.is_empty() {
            self.viewports.push(vk::Viewport::default());
        }
        if self.dynamic_states.contains(&vk::DynamicState::SCISSOR) && self.scissors.is_empty() {
            self.scissors.push(vk::Rect2D::default());
        }
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&self.viewports)
            .scissors(&self.scissors);

        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(self.logic_op_enable)
            .logic_op(self.logic_op)
            .attachments(&self.blend_states)
            .blend_constants(self.blend_constants);

        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&self.dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&self.color_formats)
            .depth_attachment_format(self.depth_format)
            .stencil_attachment_format(self.stencil_format);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&self.input_assembly)
            .tessellation_state(&self.tessellation)
            .viewport_state(&viewport_state)
            .rasterization_state(&self.rasterization)
            .multisample_state(&self.multisample)
            .depth_stencil_state(&self.depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipeline = self.pipeline_cache.create_graphics(&create_info)?;

        Ok(Pipeline {
            device: self.device,
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            heaps: self
                .heaps
                .iter()
                .map(|(&set, &(descriptor_set, _))| (set, descriptor_set))
                .collect(),
        })
    }
}

/// Builder for compute pipelines.
pub struct ComputePipelineBuilder<'a> {
    device: Arc<Device>,
    pipeline_cache: &'a PipelineCache,
    pipeline_layout_cache: &'a mut PipelineLayoutCache,
    descriptor_set_layout_cache: &'a mut DescriptorSetLayoutCache,

    shader: Option<&'a ShaderModule>,
    heaps: BTreeMap<u32, (vk::DescriptorSet, vk::DescriptorSetLayout)>,
}

impl<'a> ComputePipelineBuilder<'a> {
    pub fn new(
        device: Arc<Device>,
        pipeline_cache: &'a PipelineCache,
        pipeline_layout_cache: &'a mut PipelineLayoutCache,
        descriptor_set_layout_cache: &'a mut DescriptorSetLayoutCache,
    ) -> Self {
        Self {
            device,
            pipeline_cache,
            pipeline_layout_cache,
            descriptor_set_layout_cache,
            shader: None,
            heaps: BTreeMap::new(),
        }
    }

    /// Sets the compute shader stage.
    pub fn shader_stage(mut self, shader: &'a ShaderModule) -> Self {
        debug_assert_eq!(shader.stage(), vk::ShaderStageFlags::COMPUTE);
        self.shader = Some(shader);
        self
    }

    /// Attaches a bindless heap at `set_index`.
    pub fn resource_descriptor_heap(
        mut self,
        set_index: u32,
        heap: &ResourceDescriptorHeap,
    ) -> Self {
        self.heaps.insert(set_index, (heap.set(), heap.layout()));
        self
    }

    /// Builds the pipeline.
    pub fn build(self) -> GfxResult<Pipeline> {
        let shader = self
            .shader
            .ok_or_else(|| GfxError::Shader("Compute pipeline requires a shader stage".into()))?;

        let heap_layouts: BTreeMap<u32, vk::DescriptorSetLayout> = self
            .heaps
            .iter()
            .map(|(&set, &(_, layout))| (set, layout))
            .collect();
        let layout = build_layout(
            self.descriptor_set_layout_cache,
            self.pipeline_layout_cache,
            &[shader],
            &heap_layouts,
        )?;

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(shader.stage_create_info())
            .layout(layout);

        let pipeline = self.pipeline_cache.create_compute(&create_info)?;

        Ok(Pipeline {
            device: self.device,
            pipeline,
            layout,
            bind_point: vk::PipelineBindPoint::COMPUTE,
            heaps: self
                .heaps
                .iter()
                .map(|(&set, &(descriptor_set, _))| (set, descriptor_set))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_push_constant_ranges_merges_equal_ranges() {
        let merged = merge_push_constant_ranges(&[
            PushConstantRange {
                stages: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: 64,
            },
            PushConstantRange {
                stages: vk::ShaderStageFlags::FRAGMENT,
                offset: 0,
                size: 64,
            },
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn test_merge_push_constant_ranges_keeps_distinct_ranges() {
        let merged = merge_push_constant_ranges(&[
            PushConstantRange {
                stages: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: 64,
            },
            PushConstantRange {
                stages: vk::ShaderStageFlags::FRAGMENT,
                offset: 64,
                size: 16,
            },
        ]);
        assert_eq!(merged.len(), 2);
    }
}
