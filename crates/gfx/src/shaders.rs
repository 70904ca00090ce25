//! Shader module loading, reflection, and caching.
//!
//! Shader modules are cached by file name and loaded from the shader
//! directory (default `<cwd>/../shaders`). Each module carries its SPIR-V
//! reflection: per-set descriptor binding lists (attributed to the module's
//! stage) and one push-constant range collapsed across the module's blocks
//! to `(min offset, max end - min offset)`.

use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use tracing::info;

use crate::cache::{Cache, LayoutBinding, PushConstantRange};
use crate::device::Device;
use crate::error::{GfxError, GfxResult};

/// A shader module plus its reflection data.
pub struct ShaderModule {
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    entry_point: std::ffi::CString,
    /// Per-set binding lists, sorted by set index.
    descriptor_sets: Vec<(u32, Vec<LayoutBinding>)>,
    push_constant_range: Option<PushConstantRange>,
}

impl ShaderModule {
    /// Creates a module from SPIR-V bytes and reflects it.
    ///
    /// # Errors
    ///
    /// Returns [`GfxError::Shader`] if the bytes are not 4-byte aligned or
    /// reflection fails.
    pub fn new(
        device: &Device,
        bytes: &[u8],
        stage: vk::ShaderStageFlags,
    ) -> GfxResult<Self> {
        if bytes.len() % 4 != 0 {
            return Err(GfxError::Shader(format!(
                "SPIR-V code must be 4-byte aligned, got {} bytes",
                bytes.len()
            )));
        }

        // Reflect before creating the module, so a reflection failure does
        // not leak a live Vulkan object.
        let reflection = rspirv_reflect::Reflection::new_from_spirv(bytes)
            .map_err(|e| GfxError::Shader(format!("SPIR-V reflection failed: {:?}", e)))?;
        let descriptor_sets = reflect_descriptor_sets(&reflection, stage)?;
        let push_constant_range = reflect_push_constant_range(&reflection, stage)?;

        let code: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { device.handle().create_shader_module(&create_info, None)? };

        Ok(Self {
            module,
            stage,
            entry_point: std::ffi::CString::new("main").expect("static entry point"),
            descriptor_sets,
            push_constant_range,
        })
    }

    /// Returns the Vulkan shader module handle.
    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    /// Returns the shader stage.
    #[inline]
    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.stage
    }

    /// Per-set descriptor binding lists reflected from the module, with the
    /// module's stage as the stage flags.
    #[inline]
    pub fn descriptor_sets(&self) -> &[(u32, Vec<LayoutBinding>)] {
        &self.descriptor_sets
    }

    /// The module's collapsed push-constant range, if it declares one.
    #[inline]
    pub fn push_constant_range(&self) -> Option<PushConstantRange> {
        self.push_constant_range
    }

    /// Pipeline shader stage create info for pipeline construction.
    ///
    /// The returned struct borrows this module's entry point name.
    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage)
            .module(self.module)
            .name(&self.entry_point)
    }
}

fn reflect_descriptor_sets(
    reflection: &rspirv_reflect::Reflection,
    stage: vk::ShaderStageFlags,
) -> GfxResult<Vec<(u32, Vec<LayoutBinding>)>> {
    let sets = reflection
        .get_descriptor_sets()
        .map_err(|e| GfxError::Shader(format!("descriptor reflection failed: {:?}", e)))?;

    // BTreeMap iteration yields sets and bindings already sorted.
    let result = sets
        .into_iter()
        .map(|(set, bindings)| {
            let bindings = bindings
                .into_iter()
                .map(|(binding, info)| LayoutBinding {
                    binding,
                    ty: vk::DescriptorType::from_raw(info.ty.0 as i32),
                    count: match info.binding_count {
                        rspirv_reflect::BindingCount::One => 1,
                        rspirv_reflect::BindingCount::StaticSized(count) => count as u32,
                        // Runtime-sized arrays are bindless heaps; the heap
                        // layout overrides the reflected one at build time.
                        rspirv_reflect::BindingCount::Unbounded => 1,
                    },
                    stages: stage,
                })
                .collect();
            (set, bindings)
        })
        .collect();
    Ok(result)
}

fn reflect_push_constant_range(
    reflection: &rspirv_reflect::Reflection,
    stage: vk::ShaderStageFlags,
) -> GfxResult<Option<PushConstantRange>> {
    let range = reflection
        .get_push_constant_range()
        .map_err(|e| GfxError::Shader(format!("push constant reflection failed: {:?}", e)))?;
    Ok(range.map(|info| PushConstantRange {
        stages: stage,
        offset: info.offset,
        size: info.size,
    }))
}

/// Derives the shader stage from the conventional compiled-shader file name
/// (`name.vert.spv`, `name.frag.spv`, ...).
pub fn stage_from_file_name(name: &str) -> GfxResult<vk::ShaderStageFlags> {
    const STAGES: &[(&str, vk::ShaderStageFlags)] = &[
        (".vert.", vk::ShaderStageFlags::VERTEX),
        (".frag.", vk::ShaderStageFlags::FRAGMENT),
        (".comp.", vk::ShaderStageFlags::COMPUTE),
        (".geom.", vk::ShaderStageFlags::GEOMETRY),
        (".tesc.", vk::ShaderStageFlags::TESSELLATION_CONTROL),
        (".tese.", vk::ShaderStageFlags::TESSELLATION_EVALUATION),
    ];
    STAGES
        .iter()
        .find(|(marker, _)| name.contains(marker))
        .map(|&(_, stage)| stage)
        .ok_or_else(|| {
            GfxError::Shader(format!(
                "Cannot derive shader stage from file name '{}'",
                name
            ))
        })
}

/// Cache of shader modules keyed by file name.
pub struct ShaderModuleCache {
    device: Arc<Device>,
    base_dir: PathBuf,
    cache: Cache<String, ShaderModule>,
}

impl ShaderModuleCache {
    /// Creates a cache loading from the default shader directory
    /// (`<cwd>/../shaders`).
    pub fn new(device: Arc<Device>) -> Self {
        let base_dir = std::env::current_dir()
            .map(|cwd| cwd.join("..").join("shaders"))
            .unwrap_or_else(|_| PathBuf::from("../shaders"));
        Self::with_base_dir(device, base_dir)
    }

    /// Creates a cache loading from `base_dir`.
    pub fn with_base_dir(device: Arc<Device>, base_dir: PathBuf) -> Self {
        Self {
            device,
            base_dir,
            cache: Cache::new(),
        }
    }

    /// Ensures the module for `name` is loaded.
    ///
    /// Use together with [`ShaderModuleCache::find`] when several modules
    /// need to be borrowed at once (pipeline builders).
    pub fn load(&mut self, name: &str) -> GfxResult<()> {
        self.get(name).map(|_| ())
    }

    /// Returns an already-loaded module.
    pub fn find(&self, name: &str) -> Option<&ShaderModule> {
        self.cache.get(&name.to_owned())
    }

    /// Returns the module for `name`, loading and reflecting it on first
    /// use.
    pub fn get(&mut self, name: &str) -> GfxResult<&ShaderModule> {
        let device = &self.device;
        let base_dir = &self.base_dir;
        self.cache.get_or_create(&name.to_owned(), |name| {
            let path = base_dir.join(name);
            info!(target: "gfx", "Loading shader module from {}", path.display());
            let bytes = std::fs::read(&path).map_err(|e| {
                GfxError::Shader(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let stage = stage_from_file_name(name)?;
            ShaderModule::new(device, &bytes, stage)
        })
    }
}

impl Drop for ShaderModuleCache {
    fn drop(&mut self) {
        for module in self.cache.values() {
            unsafe {
                self.device
                    .handle()
                    .destroy_shader_module(module.module, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_from_file_name() {
        assert_eq!(
            stage_from_file_name("triangle.vert.spv").unwrap(),
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            stage_from_file_name("triangle.frag.spv").unwrap(),
            vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            stage_from_file_name("cull.comp.spv").unwrap(),
            vk::ShaderStageFlags::COMPUTE
        );
        assert!(stage_from_file_name("triangle.spv").is_err());
    }
}
