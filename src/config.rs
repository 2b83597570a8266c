use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub translator: TranslatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Translator settings are resolved once at startup; the language pair
/// is a configuration-time constant and never part of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    #[serde(default = "default_src_lang")]
    pub src_lang: String,
    #[serde(default = "default_tgt_lang")]
    pub tgt_lang: String,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_num_beams")]
    pub num_beams: usize,
    #[serde(default)]
    pub device: DeviceKind,
}

/// Compute device selection. `Auto` picks the accelerator when one is
/// available and the binary was built with the `cuda` feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_model_dir() -> String {
    "models/indictrans2-en-indic".to_string()
}

fn default_src_lang() -> String {
    "eng_Latn".to_string()
}

fn default_tgt_lang() -> String {
    "pan_Guru".to_string()
}

fn default_max_length() -> usize {
    256
}

fn default_num_beams() -> usize {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            src_lang: default_src_lang(),
            tgt_lang: default_tgt_lang(),
            max_length: default_max_length(),
            num_beams: default_num_beams(),
            device: DeviceKind::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pin_the_fixed_language_pair() {
        let config = Config::default();
        assert_eq!(config.translator.src_lang, "eng_Latn");
        assert_eq!(config.translator.tgt_lang, "pan_Guru");
        assert_eq!(config.translator.max_length, 256);
        assert_eq!(config.translator.num_beams, 1);
        assert_eq!(config.translator.device, DeviceKind::Auto);
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let yaml = "server:\n  port: 8080\ntranslator:\n  device: cpu\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.translator.device, DeviceKind::Cpu);
        assert_eq!(config.translator.tgt_lang, "pan_Guru");
    }

    #[test]
    fn empty_yaml_is_all_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.translator.model_dir, "models/indictrans2-en-indic");
    }
}
