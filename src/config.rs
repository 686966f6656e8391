//! The pipeline's configuration document: one hierarchical JSON object with
//! a section per component. Every recognized key maps onto a component
//! parameter struct; unknown keys are warned about and ignored.

use log::warn;
use serde_derive::Deserialize;

use crate::graph::{DEFAULT_LOOP_SIGMAS, DEFAULT_ODOMETRY_SIGMAS, DEFAULT_PRIOR_SIGMAS};
use crate::loop_closure::{LoopParams, ScanContextParams};
use crate::map_builder::MapParams;
use crate::odometry::OdometryParams;
use crate::preprocess::PreprocessorParams;
use crate::waypoints::WaypointParams;

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub v_pre: f32,
    pub r_min: f32,
    pub r_max: f32,
    pub remove_ground: bool,
    pub z_ground: f32,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        let params = PreprocessorParams::default();
        Self {
            v_pre: params.voxel_size,
            r_min: params.min_range,
            r_max: params.max_range,
            remove_ground: params.remove_ground,
            z_ground: params.ground_z,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    pub v_icp: f32,
    pub d_corr: f32,
    #[serde(rename = "N_it")]
    pub n_it: usize,
    pub window_k: usize,
    pub expected_step_m: f32,
}

impl Default for IcpConfig {
    fn default() -> Self {
        let params = OdometryParams::default();
        Self {
            v_icp: params.voxel_size,
            d_corr: params.max_correspondence_distance,
            n_it: params.max_iterations,
            window_k: params.window_size,
            expected_step_m: params.expected_step,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoopStrategy {
    None,
    Spatial,
    Descriptor,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub enabled: bool,
    pub strategy: LoopStrategy,
    #[serde(rename = "D_max")]
    pub d_max: f32,
    #[serde(rename = "G_min")]
    pub g_min: usize,
    pub v_loop: f32,
    pub f_loop: f32,
    #[serde(rename = "S")]
    pub num_sectors: usize,
    #[serde(rename = "R")]
    pub num_rings: usize,
    pub max_range: f32,
    #[serde(alias = "σ_sim")]
    pub sigma_sim: f32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        let params = LoopParams::default();
        let descriptor = ScanContextParams::default();
        Self {
            enabled: false,
            strategy: LoopStrategy::Spatial,
            d_max: params.distance_threshold,
            g_min: params.min_frame_gap,
            v_loop: params.voxel_size,
            f_loop: params.fitness_threshold,
            num_sectors: descriptor.num_sectors,
            num_rings: descriptor.num_rings,
            max_range: descriptor.max_range,
            sigma_sim: descriptor.similarity_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Rotation xyz (radians) then translation xyz (meters).
    #[serde(alias = "σ_odom")]
    pub sigma_odom: [f32; 6],
    #[serde(alias = "σ_loop")]
    pub sigma_loop: [f32; 6],
    #[serde(alias = "σ_prior")]
    pub sigma_prior: [f32; 6],
    pub max_iters: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            sigma_odom: DEFAULT_ODOMETRY_SIGMAS,
            sigma_loop: DEFAULT_LOOP_SIGMAS,
            sigma_prior: DEFAULT_PRIOR_SIGMAS,
            max_iters: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub v_frame: f32,
    pub v_map: f32,
    pub k_nn: usize,
    #[serde(alias = "σ_ratio")]
    pub sigma_ratio: f32,
}

impl Default for MapConfig {
    fn default() -> Self {
        let params = MapParams::default();
        Self {
            v_frame: params.frame_voxel_size,
            v_map: params.map_voxel_size,
            k_nn: params.nb_neighbors,
            sigma_ratio: params.std_ratio,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WaypointConfig {
    pub s_min: f32,
    pub z_band: Option<f32>,
    #[serde(default = "default_true")]
    pub simplify: bool,
    #[serde(alias = "ε")]
    pub epsilon: f32,
}

impl Default for WaypointConfig {
    fn default() -> Self {
        let params = WaypointParams::default();
        Self {
            s_min: params.min_distance,
            z_band: params.z_band,
            simplify: params.simplify,
            epsilon: params.tolerance,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub preprocessor: PreprocessorConfig,
    pub icp: IcpConfig,
    #[serde(rename = "loop")]
    pub loop_closure: LoopConfig,
    pub graph: GraphConfig,
    pub map: MapConfig,
    pub waypoints: WaypointConfig,
}

/// Known keys per section, used to warn about unrecognized entries without
/// rejecting the document.
const KNOWN_KEYS: &[(&str, &[&str])] = &[
    ("preprocessor", &["v_pre", "r_min", "r_max", "remove_ground", "z_ground"]),
    ("icp", &["v_icp", "d_corr", "N_it", "window_k", "expected_step_m"]),
    (
        "loop",
        &[
            "enabled", "strategy", "D_max", "G_min", "v_loop", "f_loop", "S", "R", "max_range",
            "sigma_sim", "σ_sim",
        ],
    ),
    (
        "graph",
        &["sigma_odom", "sigma_loop", "sigma_prior", "σ_odom", "σ_loop", "σ_prior", "max_iters"],
    ),
    ("map", &["v_frame", "v_map", "k_nn", "sigma_ratio", "σ_ratio"]),
    ("waypoints", &["s_min", "z_band", "simplify", "epsilon", "ε"]),
];

impl Config {
    /// Parses a JSON configuration document, warning on unknown keys and
    /// validating the result.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|err| ConfigError::new(format!("not valid JSON: {err}")))?;
        Self::from_json_value(value)
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        warn_unknown_keys(&value);
        let config: Config = serde_json::from_value(value)
            .map_err(|err| ConfigError::new(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would make the pipeline meaningless: negative
    /// voxel sizes, inverted ranges, out-of-range ratios.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preprocessor.v_pre < 0.0
            || self.icp.v_icp < 0.0
            || self.loop_closure.v_loop < 0.0
            || self.map.v_frame < 0.0
            || self.map.v_map < 0.0
        {
            return Err(ConfigError::new("voxel sizes must be non-negative"));
        }
        if self.preprocessor.r_min < 0.0 || self.preprocessor.r_min > self.preprocessor.r_max {
            return Err(ConfigError::new(format!(
                "inverted range gate [{}, {}]",
                self.preprocessor.r_min, self.preprocessor.r_max
            )));
        }
        if !(0.0..=1.0).contains(&self.loop_closure.f_loop) {
            return Err(ConfigError::new("f_loop must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.loop_closure.sigma_sim) {
            return Err(ConfigError::new("sigma_sim must lie in [0, 1]"));
        }
        if self.icp.window_k == 0 {
            return Err(ConfigError::new("window_k must be at least 1"));
        }
        if self.icp.expected_step_m <= 0.0 {
            return Err(ConfigError::new("expected_step_m must be positive"));
        }
        if self.loop_closure.num_sectors == 0 || self.loop_closure.num_rings == 0 {
            return Err(ConfigError::new("descriptor grid must be non-empty"));
        }
        if self.map.sigma_ratio < 0.0 {
            return Err(ConfigError::new("sigma_ratio must be non-negative"));
        }
        let all_sigmas = self
            .graph
            .sigma_odom
            .iter()
            .chain(self.graph.sigma_loop.iter())
            .chain(self.graph.sigma_prior.iter());
        for sigma in all_sigmas {
            if *sigma <= 0.0 {
                return Err(ConfigError::new("graph sigmas must be positive"));
            }
        }
        Ok(())
    }

    pub fn preprocessor_params(&self) -> PreprocessorParams {
        PreprocessorParams {
            voxel_size: self.preprocessor.v_pre,
            min_range: self.preprocessor.r_min,
            max_range: self.preprocessor.r_max,
            remove_ground: self.preprocessor.remove_ground,
            ground_z: self.preprocessor.z_ground,
        }
    }

    pub fn odometry_params(&self) -> OdometryParams {
        OdometryParams {
            voxel_size: self.icp.v_icp,
            max_correspondence_distance: self.icp.d_corr,
            max_iterations: self.icp.n_it,
            window_size: self.icp.window_k,
            expected_step: self.icp.expected_step_m,
        }
    }

    pub fn loop_params(&self) -> LoopParams {
        LoopParams {
            distance_threshold: self.loop_closure.d_max,
            min_frame_gap: self.loop_closure.g_min,
            voxel_size: self.loop_closure.v_loop,
            fitness_threshold: self.loop_closure.f_loop,
            max_correspondence_distance: self.icp.d_corr,
            max_iterations: self.icp.n_it,
        }
    }

    pub fn scan_context_params(&self) -> ScanContextParams {
        ScanContextParams {
            num_sectors: self.loop_closure.num_sectors,
            num_rings: self.loop_closure.num_rings,
            max_range: self.loop_closure.max_range,
            similarity_threshold: self.loop_closure.sigma_sim,
        }
    }

    pub fn map_params(&self) -> MapParams {
        MapParams {
            frame_voxel_size: self.map.v_frame,
            map_voxel_size: self.map.v_map,
            nb_neighbors: self.map.k_nn,
            std_ratio: self.map.sigma_ratio,
            ..Default::default()
        }
    }

    pub fn waypoint_params(&self) -> WaypointParams {
        WaypointParams {
            min_distance: self.waypoints.s_min,
            z_band: self.waypoints.z_band,
            simplify: self.waypoints.simplify,
            tolerance: self.waypoints.epsilon,
        }
    }
}

fn warn_unknown_keys(value: &serde_json::Value) {
    let document = match value.as_object() {
        Some(document) => document,
        None => return,
    };

    for (section, entries) in document {
        match KNOWN_KEYS.iter().find(|(name, _)| name == section) {
            None => warn!("configuration: unknown section '{section}'"),
            Some((_, known)) => {
                if let Some(entries) = entries.as_object() {
                    for key in entries.keys() {
                        if !known.contains(&key.as_str()) {
                            warn!("configuration: unknown key '{section}.{key}'");
                        }
                    }
                }
            }
        }
    }
}
