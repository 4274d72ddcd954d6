// This module handles config.toml.
// Everything has a default, and the defaults reproduce the reference workflow exactly,
// so running without a config file is fine.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// Samplers built into ComfyUI. Custom nodes can register more.
pub const KNOWN_SAMPLERS: &[&str] = &[
    "euler", "euler_cfg_pp", "euler_ancestral", "euler_ancestral_cfg_pp", "heun", "heunpp2",
    "dpm_2", "dpm_2_ancestral", "lms", "dpm_fast", "dpm_adaptive", "dpmpp_2s_ancestral",
    "dpmpp_2s_ancestral_cfg_pp", "dpmpp_sde", "dpmpp_sde_gpu", "dpmpp_2m", "dpmpp_2m_cfg_pp",
    "dpmpp_2m_sde", "dpmpp_2m_sde_gpu", "dpmpp_3m_sde", "dpmpp_3m_sde_gpu", "ddpm", "lcm",
    "ipndm", "ipndm_v", "deis", "ddim", "uni_pc", "uni_pc_bh2",
];

pub const KNOWN_SCHEDULERS: &[&str] = &[
    "normal", "karras", "exponential", "sgm_uniform", "simple", "ddim_uniform", "beta",
];

/// LoraStackLoader_PoP has exactly this many slots.
pub const LORA_SLOTS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub output_dir: PathBuf,
    /// How many times the sampler/decode/save chain runs, each with a fresh seed.
    pub iterations: u32,
    pub backend: BackendConfig,
    pub workflow: WorkflowParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    /// Empty means "make one up at startup".
    pub client_id: String,
    /// Start ComfyUI ourselves if it isn't already running.
    pub launch: bool,
    pub python: String,
    pub launch_timeout_secs: u64,
    /// Upper bound on how long a single prompt may take.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkflowParams {
    pub checkpoint: String,
    pub positive: String,
    pub negative: String,
    pub filename_prefix: String,
    pub deep_cache: DeepCacheParams,
    pub freeu: FreeUParams,
    pub aspect: AspectParams,
    pub sampler: SamplerParams,
    pub loras: Vec<LoraSlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeepCacheParams {
    pub cache_interval: u32,
    pub cache_depth: u32,
    pub start_step: u32,
    pub end_step: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FreeUParams {
    pub b1: f64,
    pub b2: f64,
    pub s1: f64,
    pub s2: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoraSlot {
    pub enabled: bool,
    pub name: String,
    pub strength_model: f64,
    pub strength_clip: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AspectParams {
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: String,
    pub swap_dimensions: bool,
    pub upscale_factor: f64,
    pub prescale_factor: f64,
    pub batch_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplerParams {
    pub add_noise: bool,
    /// Fixed seed. When unset, every iteration draws a random one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub steps: u32,
    pub cfg: f64,
    pub sampler_name: String,
    pub scheduler: String,
    pub start_at_step: u32,
    pub end_at_step: u32,
    pub return_with_leftover_noise: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            iterations: 1,
            backend: BackendConfig::default(),
            workflow: WorkflowParams::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8188,
            client_id: "".to_string(),
            launch: false,
            python: "python".to_string(),
            launch_timeout_secs: 120,
            timeout_secs: 600,
        }
    }
}

impl Default for WorkflowParams {
    fn default() -> Self {
        Self {
            checkpoint: "zavychromaxl_v40.safetensors".to_string(),
            positive: "Beautiful woman in blonde".to_string(),
            negative: DEFAULT_NEGATIVE.to_string(),
            filename_prefix: "ComfyUI".to_string(),
            deep_cache: DeepCacheParams::default(),
            freeu: FreeUParams::default(),
            aspect: AspectParams::default(),
            sampler: SamplerParams::default(),
            loras: vec![
                LoraSlot::on("xl_more_art-full_v1.safetensors", 0.2),
                LoraSlot::on("extremely detailed.safetensors", 0.2),
                LoraSlot::off(),
            ],
        }
    }
}

const DEFAULT_NEGATIVE: &str = "bad face, bad hand, bad legs, bad lips, bad eyes, bad nose, distortion, merged people, exposed genital body parts, exposed breasts, exposed boobs, nudity, cleavage, bikini, underwear, swimwear, half exposed boobs, half exposed breast, extra fingers, missing fingers, missing leg, extra legs, mutation, bad anatomy, nighty";

impl Default for DeepCacheParams {
    fn default() -> Self {
        Self {
            cache_interval: 3,
            cache_depth: 5,
            start_step: 0,
            end_step: 1000,
        }
    }
}

impl Default for FreeUParams {
    fn default() -> Self {
        Self {
            b1: 1.1,
            b2: 1.2,
            s1: 0.6,
            s2: 0.4,
        }
    }
}

impl Default for AspectParams {
    fn default() -> Self {
        Self {
            width: 1320,
            height: 1024,
            aspect_ratio: "custom".to_string(),
            swap_dimensions: false,
            upscale_factor: 1.0,
            prescale_factor: 1.0,
            batch_size: 2,
        }
    }
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            add_noise: true,
            seed: None,
            steps: 18,
            cfg: 3.0,
            sampler_name: "uni_pc".to_string(),
            scheduler: "karras".to_string(),
            start_at_step: 0,
            end_at_step: 10000,
            return_with_leftover_noise: true,
        }
    }
}

impl LoraSlot {
    fn on(name: &str, strength: f64) -> Self {
        Self {
            enabled: true,
            name: name.to_string(),
            strength_model: strength,
            strength_clip: strength,
        }
    }

    fn off() -> Self {
        Self {
            enabled: false,
            name: "None".to_string(),
            strength_model: 1.0,
            strength_clip: 1.0,
        }
    }
}

pub fn read_config(path: &Path) -> Result<RunnerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Error reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Error parsing {}", path.display()))
}

impl RunnerConfig {
    /// Loads the config file if one was given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => read_config(path),
            None => Ok(Self::default()),
        }
    }

    /// Fills in a random client ID if none was configured.
    pub fn resolve_client_id(&mut self) {
        if self.backend.client_id.is_empty() {
            self.backend.client_id = uuid::Uuid::new_v4().to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.workflow;
        if self.iterations < 1 {
            bail!("iterations must be at least 1");
        }
        if w.sampler.steps < 1 || w.aspect.batch_size < 1 {
            bail!("steps and batch_size must be at least 1");
        }
        if w.sampler.start_at_step > w.sampler.end_at_step {
            bail!(
                "start_at_step ({}) is after end_at_step ({})",
                w.sampler.start_at_step,
                w.sampler.end_at_step
            );
        }
        if !(0.0..=100.0).contains(&w.sampler.cfg) {
            bail!("cfg must be between 0 and 100");
        }
        if w.deep_cache.start_step > w.deep_cache.end_step {
            bail!("DeepCache start_step is after end_step");
        }
        if w.loras.len() != LORA_SLOTS {
            bail!("Expected exactly {} LoRA slots, got {}", LORA_SLOTS, w.loras.len());
        }
        for (i, slot) in w.loras.iter().enumerate() {
            if slot.enabled && (slot.name.is_empty() || slot.name == "None") {
                bail!("LoRA slot {} is enabled but has no LoRA name", i + 1);
            }
        }
        check_known("sampler", &w.sampler.sampler_name, KNOWN_SAMPLERS)?;
        check_known("scheduler", &w.sampler.scheduler, KNOWN_SCHEDULERS)?;
        Ok(())
    }
}

/// Near misses are almost certainly typos, so they're errors. Anything further away
/// might come from a custom node, and is let through with a warning.
fn check_known(what: &str, name: &str, known: &[&str]) -> Result<()> {
    if known.contains(&name) {
        return Ok(());
    }
    let mut best_distance = usize::MAX;
    let mut best = None;
    for candidate in known {
        let distance = strsim::levenshtein(name, candidate);
        if distance < best_distance {
            best_distance = distance;
            best = Some(candidate);
        }
    }
    match best {
        Some(best) if best_distance <= 2 => {
            bail!("Unknown {}: {}. Did you mean {}?", what, name, best)
        }
        _ => {
            warn!(
                "{} {:?} is not built into ComfyUI; assuming a custom node provides it",
                what, name
            );
            Ok(())
        }
    }
}

#[cfg(test)]
pub fn testconfig() -> RunnerConfig {
    toml::from_str(include_str!("../testdata/config.toml")).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization() {
        let mut config = RunnerConfig::default();
        config.workflow.sampler.seed = Some(42);
        config.workflow.loras[2] = LoraSlot::on("foo.safetensors", 0.5);
        let text = toml::to_string(&config).unwrap();
        let config2: RunnerConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, config2);
    }

    #[test]
    fn test_testconfig_matches_defaults() {
        // The sample config spells out every default.
        assert_eq!(testconfig(), RunnerConfig::default());
        // And serializing the defaults gives the same layout, table for table.
        let golden = include_str!("../testdata/config.toml");
        let text = toml::to_string(&RunnerConfig::default()).unwrap();
        for header in golden.lines().filter(|l| l.starts_with('[')) {
            assert!(text.contains(header), "missing {} in:\n{}", header, text);
        }
        for key in ["output_dir = \"output\"", "iterations = 1", "port = 8188"] {
            assert!(golden.contains(key) && text.contains(key), "{}", key);
        }
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: RunnerConfig = toml::from_str("").unwrap();
        assert_eq!(config, RunnerConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_override() {
        let config: RunnerConfig = toml::from_str(
            "iterations = 3\n[workflow.sampler]\nsteps = 30\nseed = 7\n",
        )
        .unwrap();
        assert_eq!(config.iterations, 3);
        assert_eq!(config.workflow.sampler.steps, 30);
        assert_eq!(config.workflow.sampler.seed, Some(7));
        assert_eq!(config.workflow.sampler.scheduler, "karras");
        assert_eq!(config.backend.port, 8188);
    }

    #[test]
    fn test_sampler_typo_suggests() {
        let mut config = RunnerConfig::default();
        config.workflow.sampler.sampler_name = "uni_pcc".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert_eq!(err, "Unknown sampler: uni_pcc. Did you mean uni_pc?");
    }

    #[test]
    fn test_custom_sampler_passes() {
        let mut config = RunnerConfig::default();
        config.workflow.sampler.sampler_name = "some_plugin_sampler".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_configs() {
        let mut config = RunnerConfig::default();
        config.workflow.loras.pop();
        assert!(config.validate().is_err());

        let mut config = RunnerConfig::default();
        config.workflow.loras[2].enabled = true;
        assert!(config.validate().is_err());

        let mut config = RunnerConfig::default();
        config.workflow.sampler.start_at_step = 20;
        config.workflow.sampler.end_at_step = 10;
        assert!(config.validate().is_err());

        let mut config = RunnerConfig::default();
        config.iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_client_id() {
        let mut config = RunnerConfig::default();
        config.resolve_client_id();
        assert_eq!(config.backend.client_id.len(), 36);
        let id = config.backend.client_id.clone();
        config.resolve_client_id();
        assert_eq!(config.backend.client_id, id);
    }
}
