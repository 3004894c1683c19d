// gpu/vram.rs — Total device memory, read from the driver.
//
// wgpu reports per-buffer limits, not capacity, so the size comes from
// outside it:
//
//   DRM drivers (amdgpu)   /sys/class/drm/*/device/mem_info_vram_total,
//                          matched to the adapter by the PCI vendor and
//                          device ids in the same directory
//   NVIDIA                 nvidia-smi --query-gpu=name,memory.total
//
// Anything else has no known size.

use std::path::Path;
use std::process::Command;

use tracing::debug;

const PCI_VENDOR_NVIDIA: u32 = 0x10de;

/// Total memory of the adapter described by `info`, in bytes.
pub fn query_vram(info: &wgpu::AdapterInfo) -> Option<u64> {
    if info.device_type == wgpu::DeviceType::Cpu {
        return None;
    }
    let bytes = sysfs_vram(info.vendor, info.device).or_else(|| {
        if info.vendor == PCI_VENDOR_NVIDIA {
            nvidia_smi_vram(&info.name)
        } else {
            None
        }
    });
    debug!(adapter = %info.name, ?bytes, "device memory");
    bytes
}

/// Parse a sysfs PCI id such as `0x1002\n`.
pub fn parse_pci_id(text: &str) -> Option<u32> {
    let text = text.trim();
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u32::from_str_radix(digits, 16).ok()
}

/// Pick the memory size of GPU `name` from `nvidia-smi` CSV output
/// (`name, MiB` per line). A single listed GPU is taken whatever its name.
pub fn parse_nvidia_smi(text: &str, name: &str) -> Option<u64> {
    let gpus: Vec<(&str, u64)> = text
        .lines()
        .filter_map(|line| {
            let (gpu, mib) = line.rsplit_once(',')?;
            Some((gpu.trim(), mib.trim().parse().ok()?))
        })
        .collect();
    let mib = match gpus.iter().find(|(gpu, _)| *gpu == name.trim()) {
        Some(&(_, mib)) => mib,
        None if gpus.len() == 1 => gpus[0].1,
        None => return None,
    };
    Some(mib << 20)
}

fn sysfs_vram(vendor: u32, device: u32) -> Option<u64> {
    let cards = std::fs::read_dir("/sys/class/drm").ok()?;
    cards.flatten().find_map(|entry| {
        let dir = entry.path().join("device");
        let id = |file: &str| read_trimmed(&dir.join(file)).and_then(|s| parse_pci_id(&s));
        if id("vendor")? != vendor || id("device")? != device {
            return None;
        }
        read_trimmed(&dir.join("mem_info_vram_total"))?.parse().ok()
    })
}

fn nvidia_smi_vram(name: &str) -> Option<u64> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout), name)
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pci_id() {
        assert_eq!(parse_pci_id("0x1002\n"), Some(0x1002));
        assert_eq!(parse_pci_id("10de"), Some(0x10de));
        assert_eq!(parse_pci_id("vendor"), None);
    }

    #[test]
    fn test_nvidia_smi_picks_named_gpu() {
        let out = "NVIDIA GeForce RTX 3060, 12288\nNVIDIA GeForce RTX 4090, 24564\n";
        assert_eq!(parse_nvidia_smi(out, "NVIDIA GeForce RTX 4090"), Some(24564 << 20));
        assert_eq!(parse_nvidia_smi(out, "NVIDIA A100"), None);
    }

    #[test]
    fn test_nvidia_smi_single_gpu_any_name() {
        assert_eq!(parse_nvidia_smi("Tesla T4, 15360\n", "NVIDIA Tesla T4"), Some(15360 << 20));
        assert_eq!(parse_nvidia_smi("", "x"), None);
        assert_eq!(parse_nvidia_smi("No devices were found\n", "x"), None);
    }
}
