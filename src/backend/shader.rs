// Shader module loading
//
// Vulkan consumes SPIR-V bytecode. The triangle's two stages are compiled by
// build.rs and read from disk when the pipeline is built.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use super::VulkanDevice;

/// Read a SPIR-V file into aligned 32-bit words
pub fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader file {:?}", path))?;
    parse_spirv(&bytes).with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

/// Decode SPIR-V bytes, checking size and magic number
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    // read_spv handles alignment and endianness via the magic number
    let words = ash::util::read_spv(&mut Cursor::new(bytes))?;
    Ok(words)
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Load a shader file straight into a module
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let code = read_spirv(path)?;
    log::debug!("Loaded {:?} ({} words)", path, code.len());
    create_shader_module(device, &code)
}
