use std::borrow::Cow;
use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::error::ApiError;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Error)]
pub enum CreateShaderModuleError {
    #[error("SPIR-V byte slice length ({0}) is not a non-zero multiple of 4")]
    InvalidLength(usize),

    #[error("Bytes do not start with the SPIR-V magic number (got {0:#010x})")]
    BadMagic(u32),

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A single pipeline stage an entry point can be compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Reinterpret SPIR-V bytes as little-endian words.
///
/// Borrows when the slice is already `u32`-aligned on a little-endian
/// target, copies otherwise.
pub fn spirv_words(bytes: &[u8]) -> Result<Cow<'_, [u32]>, CreateShaderModuleError> {
    if bytes.is_empty() || !bytes.len().is_multiple_of(4) {
        return Err(CreateShaderModuleError::InvalidLength(bytes.len()));
    }
    let words: Cow<'_, [u32]> = match bytemuck::try_cast_slice::<u8, u32>(bytes) {
        Ok(words) if cfg!(target_endian = "little") => Cow::Borrowed(words),
        _ => Cow::Owned(
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
    };
    if words[0] != SPIRV_MAGIC {
        return Err(CreateShaderModuleError::BadMagic(words[0]));
    }
    Ok(words)
}

/// An owned `VkShaderModule`. The bytecode is opaque to this crate
/// beyond the magic-number check.
pub struct ShaderModule {
    parent: Arc<Device>,
    handle: vk::ShaderModule,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Create a shader module from raw SPIR-V bytes.
    pub fn new(
        device: &Arc<Device>,
        spirv_bytes: &[u8],
        name: Option<&str>,
    ) -> Result<Self, CreateShaderModuleError> {
        let code = spirv_words(spirv_bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        // SAFETY: create_info contains SPIR-V words starting with the magic
        // number; the driver validates the rest.
        let handle = unsafe { device.create_raw_shader_module(&create_info) }?;
        // SAFETY: handle is a valid shader module created from device.
        unsafe { device.name_or_warn(handle, "shader module", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// Returns `Err` only if `name` contains an interior NUL byte.
    pub fn entry_point(
        &self,
        name: &str,
        stage: ShaderStage,
    ) -> Result<EntryPoint<'_>, std::ffi::NulError> {
        Ok(EntryPoint {
            module: self,
            name: CString::new(name)?,
            stage,
        })
    }

    pub fn raw_shader_module(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: handle was created from parent. Pipelines keep their own
        // copy of the code, so they may outlive the module.
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}

/// A [`ShaderModule`] paired with an entry point name and stage.
///
/// Borrows the module so it stays alive while any stage create info
/// derived from it is in use.
#[derive(Debug)]
pub struct EntryPoint<'a> {
    module: &'a ShaderModule,
    name: CString,
    stage: ShaderStage,
}

impl EntryPoint<'_> {
    /// The returned struct borrows from `self`.
    pub fn as_pipeline_stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.into())
            .module(self.module.raw_shader_module())
            .name(&self.name)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes() -> Vec<u8> {
        [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    #[test]
    fn words_decode_little_endian() {
        let bytes = module_bytes();
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
        assert_eq!(words[1], 0x0001_0000);
    }

    #[test]
    fn unaligned_input_is_copied() {
        let mut padded = vec![0u8];
        padded.extend(module_bytes());
        let words = spirv_words(&padded[1..]).unwrap();
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn ragged_length_is_rejected() {
        assert!(matches!(
            spirv_words(&[1, 2, 3]),
            Err(CreateShaderModuleError::InvalidLength(3))
        ));
        assert!(matches!(
            spirv_words(&[]),
            Err(CreateShaderModuleError::InvalidLength(0))
        ));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let bytes = 0xdead_beefu32.to_le_bytes();
        assert!(matches!(
            spirv_words(&bytes),
            Err(CreateShaderModuleError::BadMagic(0xdead_beef))
        ));
    }
}
