//! Gateway configuration
//!
//! A JSON file maps request paths to backing devices and per-path feature
//! switches. Each path enables some subset of the verbs: plain PUT, VHD
//! PUT, VHD GET, and the two BITS upload modes.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use vdigate_core::{Error, Result, BLOCK_SIZE};
use vdigate_export::{BlockRoute, ExportParams, SHADOW_DEVICE};
use vdigate_vhd::BlockBitmap;

/// Top-level gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Listen address, e.g. `127.0.0.1:8080`
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Request path -> per-path settings
    pub paths: HashMap<String, PathConfig>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl GatewayConfig {
    /// Load and parse a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::internal(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: GatewayConfig = serde_json::from_str(&data)
            .map_err(|e| Error::internal(format!("cannot parse config: {}", e)))?;
        Ok(config)
    }
}

/// Per-path settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PathConfig {
    /// The raw backing device for this path
    pub backing: PathBuf,

    /// Allow plain positioned PUT
    pub enable_put: bool,
    /// Allow VHD-stream PUT
    pub enable_putvhd: bool,
    /// Allow synthesized VHD GET/HEAD
    pub enable_getvhd: bool,
    /// Allow raw BITS uploads
    pub enable_bits: bool,
    /// Allow VHD-stream BITS uploads
    pub enable_bitsvhd: bool,

    /// Sparse-aware writes for VHD PUT
    pub putvhd_sparse: bool,
    /// Sparse-aware writes for VHD BITS
    pub bitsvhd_sparse: bool,

    /// Synthesis parameters for GET/HEAD
    pub getvhd: ExportSettings,
}

/// `getvhd.*` settings for one path
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ExportSettings {
    /// Declared backing-device size
    pub vdi_size: u64,
    /// Disk UUID (generated per request when absent)
    pub uuid: Option<Uuid>,
    /// Parent disk UUID; presence makes the image differencing
    pub parent_uuid: Option<Uuid>,
    /// Parent image path
    pub parent_path: Option<String>,
    /// base64+zlib block-presence bitmap; empty selects every block
    pub blocks: String,
    /// Skip the backing probe and route blocks via `block_map`
    pub non_leaf: bool,
    /// `device1:b64;device2:b64;...` per-device presence bitmaps; device
    /// names are resolved under /dev
    pub block_map: String,
    /// Filler device for unrouted blocks
    pub shadow: Option<PathBuf>,
}

impl ExportSettings {
    /// Resolve into synthesizer parameters for the given backing device.
    pub fn to_export_params(&self, backing: &Path) -> Result<ExportParams> {
        if self.vdi_size == 0 {
            return Err(Error::internal("getvhd.vdi_size not configured"));
        }

        let mut params = ExportParams::new(backing, self.vdi_size);
        params.uuid = self.uuid;
        params.parent_uuid = self.parent_uuid;
        params.parent_path = self.parent_path.clone();
        params.blocks = self.blocks.clone();
        params.non_leaf = self.non_leaf;
        params.block_map = parse_block_map(&self.block_map, self.vdi_size)?;
        if let Some(shadow) = &self.shadow {
            params.shadow = shadow.clone();
        } else {
            params.shadow = PathBuf::from(SHADOW_DEVICE);
        }
        Ok(params)
    }
}

/// Parse the `dev:b64;dev:b64` routing string, decoding one presence bitmap
/// per auxiliary device.
fn parse_block_map(map: &str, vdi_size: u64) -> Result<Vec<BlockRoute>> {
    if map.is_empty() {
        return Ok(Vec::new());
    }

    let num_blocks = vdi_size.div_ceil(BLOCK_SIZE) as usize;
    let mut routes = Vec::new();
    for entry in map.split(';') {
        let (dev, blocks) = entry
            .split_once(':')
            .ok_or_else(|| Error::bad_request(format!("missing colon in block_map entry '{}'", entry)))?;
        let device = PathBuf::from("/dev").join(dev);
        tracing::debug!(device = %device.display(), "parsed block_map entry");
        routes.push(BlockRoute {
            device,
            blocks: BlockBitmap::decode(blocks, num_blocks)?,
        });
    }
    Ok(routes)
}
