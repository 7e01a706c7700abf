use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MorphError, Result};

/// Generator network family a profile's weights belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeneratorArch {
    /// Linear stem + stride-2 transposed convolutions.
    Dcgan { base_channels: usize },
    /// Linear stem + residual nearest-upsampling blocks.
    Resnet { channels: usize },
    /// Single fully-connected decoder.
    Dense,
}

/// Everything needed to load and display one generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub model_id: String,
    pub description: String,
    pub weights: PathBuf,
    pub arch: GeneratorArch,
    pub latent_dim: usize,
    pub native_size: usize,
    pub upscale_multiplier: usize,
    #[serde(default = "default_animate_frames")]
    pub animate_frames: usize,
}

fn default_animate_frames() -> usize {
    10
}

impl ModelProfile {
    pub fn display_size(&self) -> usize {
        self.native_size * self.upscale_multiplier
    }

    pub fn validate(&self) -> Result<()> {
        if self.latent_dim == 0 {
            return Err(invalid(format!("{}: latent_dim must be > 0", self.model_id)));
        }
        if self.upscale_multiplier == 0 {
            return Err(invalid(format!(
                "{}: upscale_multiplier must be >= 1",
                self.model_id
            )));
        }
        match self.arch {
            // Conv stems start at 4x4 and double per block.
            GeneratorArch::Dcgan { .. } | GeneratorArch::Resnet { .. } => {
                if self.native_size < 8 || !self.native_size.is_power_of_two() {
                    return Err(invalid(format!(
                        "{}: native_size {} must be a power of two >= 8",
                        self.model_id, self.native_size
                    )));
                }
            }
            GeneratorArch::Dense => {
                if self.native_size == 0 {
                    return Err(invalid(format!("{}: native_size must be > 0", self.model_id)));
                }
            }
        }
        Ok(())
    }
}

/// The three CelebA-HQ generators the installation ships with. All render at
/// 256x256 on screen.
pub fn builtin_profiles() -> Vec<ModelProfile> {
    vec![
        ModelProfile {
            model_id: "dcgan64".to_string(),
            description: "DCGAN, 64x64 (16 MB)".to_string(),
            weights: PathBuf::from("models/dcgan64.safetensors"),
            arch: GeneratorArch::Dcgan { base_channels: 512 },
            latent_dim: 128,
            native_size: 64,
            upscale_multiplier: 4,
            animate_frames: 10,
        },
        ModelProfile {
            model_id: "resnet128".to_string(),
            description: "ResNet, 128x128 (252 MB)".to_string(),
            weights: PathBuf::from("models/resnet128.safetensors"),
            arch: GeneratorArch::Resnet { channels: 512 },
            latent_dim: 128,
            native_size: 128,
            upscale_multiplier: 2,
            animate_frames: 10,
        },
        ModelProfile {
            model_id: "resnet256".to_string(),
            description: "ResNet, 256x256 (252 MB)".to_string(),
            weights: PathBuf::from("models/resnet256.safetensors"),
            arch: GeneratorArch::Resnet { channels: 512 },
            latent_dim: 128,
            native_size: 256,
            upscale_multiplier: 1,
            animate_frames: 200,
        },
    ]
}

/// Knobs for one projection session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSettings {
    pub learning_rate: f64,
    pub training_steps: usize,
    pub steps_per_image: usize,
    pub num_projections: usize,
    /// Base seed; slot `i` draws from `seed + i`. Entropy-seeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            training_steps: 200,
            steps_per_image: 5,
            num_projections: 2,
            seed: None,
        }
    }
}

impl ProjectionSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.steps_per_image == 0 {
            return Err(invalid("steps_per_image must be >= 1".to_string()));
        }
        if self.num_projections == 0 {
            return Err(invalid("num_projections must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Knobs for the live morph loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbationSettings {
    /// Inverse strength: the standardized spectrum is divided by this.
    pub damping_of_change: f32,
    /// Minimum spacing between two perturbations.
    pub morph_delay_ms: u64,
}

impl Default for PerturbationSettings {
    fn default() -> Self {
        Self {
            damping_of_change: 10.0,
            morph_delay_ms: 50,
        }
    }
}

impl PerturbationSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.damping_of_change.is_finite() && self.damping_of_change > 0.0) {
            return Err(invalid(format!(
                "damping_of_change must be positive, got {}",
                self.damping_of_change
            )));
        }
        Ok(())
    }
}

/// How a spectrum of the wrong length is mapped onto the latent dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectrumFit {
    /// Length must equal the latent dimension.
    #[default]
    Exact,
    /// Drop trailing bins, or zero-pad missing ones.
    TruncateOrPad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSettings {
    /// Only spectra from this channel drive the morph.
    pub channel: String,
    pub bins: usize,
    #[serde(default)]
    pub fit: SpectrumFit,
}

impl Default for SpectrumSettings {
    fn default() -> Self {
        Self {
            channel: "AF7".to_string(),
            bins: 128,
            fit: SpectrumFit::Exact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8765,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub use_gpu: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallationConfig {
    pub model: String,
    pub models: Vec<ModelProfile>,
    pub projection: ProjectionSettings,
    pub perturbation: PerturbationSettings,
    pub spectrum: SpectrumSettings,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub device: DeviceSettings,
}

impl Default for InstallationConfig {
    fn default() -> Self {
        Self {
            model: "dcgan64".to_string(),
            models: builtin_profiles(),
            projection: ProjectionSettings::default(),
            perturbation: PerturbationSettings::default(),
            spectrum: SpectrumSettings::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
            device: DeviceSettings::default(),
        }
    }
}

impl InstallationConfig {
    /// Missing file means defaults. Parsed files are validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        if !path.as_ref().exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for profile in &self.models {
            profile.validate()?;
        }
        if self.profile(&self.model).is_none() {
            return Err(MorphError::UnknownModel(self.model.clone()));
        }
        self.projection.validate()?;
        self.perturbation.validate()?;
        if self.spectrum.bins == 0 {
            return Err(invalid("spectrum.bins must be >= 1".to_string()));
        }
        Ok(())
    }

    pub fn profile(&self, model_id: &str) -> Option<&ModelProfile> {
        self.models.iter().find(|p| p.model_id == model_id)
    }
}

fn invalid(msg: String) -> MorphError {
    MorphError::InvalidSettings(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles_share_display_size() {
        for profile in builtin_profiles() {
            assert_eq!(profile.latent_dim, 128);
            assert_eq!(profile.display_size(), 256, "{}", profile.model_id);
            assert!(profile.validate().is_ok());
        }
    }

    #[test]
    fn test_missing_file_gives_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = InstallationConfig::load(dir.path().join("absent.toml"))?;
        assert_eq!(config, InstallationConfig::default());
        Ok(())
    }

    #[test]
    fn test_partial_toml_keeps_defaults() -> Result<()> {
        let config = InstallationConfig::from_toml(
            r#"
            model = "resnet128"

            [perturbation]
            damping_of_change = 4.0
            morph_delay_ms = 1000
            "#,
        )?;
        assert_eq!(config.model, "resnet128");
        assert_eq!(config.perturbation.morph_delay_ms, 1000);
        assert_eq!(config.projection, ProjectionSettings::default());
        Ok(())
    }

    #[test]
    fn test_rejects_unknown_model() {
        let err = InstallationConfig::from_toml(r#"model = "stylegan""#).unwrap_err();
        assert!(matches!(err, MorphError::UnknownModel(_)));
    }

    #[test]
    fn test_projection_settings_validation() {
        let mut s = ProjectionSettings::default();
        assert!(s.validate().is_ok());
        s.num_projections = 0;
        assert!(s.validate().is_err());
        s.num_projections = 1;
        s.learning_rate = -0.1;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_perturbation_settings_validation() {
        let mut s = PerturbationSettings::default();
        assert!(s.validate().is_ok());
        s.damping_of_change = 0.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_profile_arch_from_toml() -> Result<()> {
        let config = InstallationConfig::from_toml(
            r#"
            model = "tiny"

            [[models]]
            model_id = "tiny"
            description = "dense test decoder"
            weights = "models/tiny.safetensors"
            latent_dim = 8
            native_size = 4
            upscale_multiplier = 2
            arch = { kind = "dense" }
            "#,
        )?;
        let profile = config.profile("tiny").expect("profile");
        assert_eq!(profile.arch, GeneratorArch::Dense);
        assert_eq!(profile.animate_frames, 10);
        assert_eq!(profile.display_size(), 8);
        Ok(())
    }
}
