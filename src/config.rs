use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::llm::http::HttpConfig;
#[cfg(feature = "llama")]
use crate::llm::llama::ModelConfig;
use crate::persist::JsonDirPersistence;
use crate::story::layout::LayoutConfig;
use crate::story::navigator::NavigationPolicy;

pub const USAGE: &str = "\
Usage: branchtale <endpoint-url | model.gguf> [story-dir | :memory:]

Examples:
  branchtale http://localhost:1234
  branchtale ./models/qwen2.5-3b-instruct-q4_k_m.gguf   (needs the `llama` feature)

Environment:
  BRANCHTALE_MODEL          model name sent to the HTTP endpoint
  BRANCHTALE_TEMPERATURE    sampling temperature
  BRANCHTALE_TIMEOUT_SECS   HTTP request timeout
  BRANCHTALE_MIN_PATH       parts needed before a story can be ended
  BRANCHTALE_GPU_LAYERS     layers offloaded to GPU (llama)
  BRANCHTALE_CTX            context size in tokens (llama)
  BRANCHTALE_MAX_TOKENS     tokens generated per reply (llama)

Logging: set RUST_LOG=debug or RUST_LOG=trace for verbose output";

/// Which generation backend to talk to.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Http(HttpConfig),
    #[cfg(feature = "llama")]
    Llama { model_path: String, model: ModelConfig },
}

/// Where stories are kept between sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    Dir(PathBuf),
    /// Nothing is written; stories vanish on exit.
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub storage: Storage,
    pub policy: NavigationPolicy,
    pub layout: LayoutConfig,
}

impl AppConfig {
    /// Build from positional arguments (program name excluded) and an
    /// environment lookup. Unparseable numbers fall back to defaults.
    pub fn from_args<F>(args: &[String], env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let target = args.first().context(USAGE)?;
        let parsed = |key: &str| env(key).and_then(|v| v.trim().parse::<f64>().ok());

        let backend = if target.ends_with(".gguf") {
            gguf_backend(target, &parsed)?
        } else if target.starts_with("http://") || target.starts_with("https://") {
            let defaults = HttpConfig::default();
            BackendConfig::Http(HttpConfig {
                endpoint: target.clone(),
                model: env("BRANCHTALE_MODEL").unwrap_or(defaults.model),
                temperature: parsed("BRANCHTALE_TEMPERATURE")
                    .filter(|t| t.is_finite() && *t >= 0.0)
                    .map(|t| t as f32)
                    .unwrap_or(defaults.temperature),
                timeout: parsed("BRANCHTALE_TIMEOUT_SECS")
                    .filter(|s| *s > 0.0)
                    .and_then(|s| Duration::try_from_secs_f64(s).ok())
                    .unwrap_or(defaults.timeout),
            })
        } else {
            bail!("unrecognised backend '{target}'\n\n{USAGE}");
        };

        let storage = match args.get(1).map(String::as_str) {
            Some(":memory:") => Storage::Memory,
            Some(dir) => Storage::Dir(PathBuf::from(dir)),
            None => Storage::Dir(JsonDirPersistence::default_dir()),
        };

        let policy = NavigationPolicy {
            min_path_len: parsed("BRANCHTALE_MIN_PATH")
                .filter(|n| *n >= 1.0)
                .map(|n| n as usize)
                .unwrap_or(NavigationPolicy::default().min_path_len),
        };

        Ok(Self {
            backend,
            storage,
            policy,
            layout: LayoutConfig::default(),
        })
    }
}

#[cfg(feature = "llama")]
fn gguf_backend(path: &str, parsed: &dyn Fn(&str) -> Option<f64>) -> Result<BackendConfig> {
    let defaults = ModelConfig::default();
    Ok(BackendConfig::Llama {
        model_path: path.to_string(),
        model: ModelConfig {
            n_gpu_layers: parsed("BRANCHTALE_GPU_LAYERS")
                .map(|n| n as u32)
                .unwrap_or(defaults.n_gpu_layers),
            n_ctx: parsed("BRANCHTALE_CTX")
                .filter(|n| *n >= 1.0)
                .map(|n| n as u32)
                .unwrap_or(defaults.n_ctx),
            max_tokens: parsed("BRANCHTALE_MAX_TOKENS")
                .filter(|n| *n >= 1.0)
                .map(|n| n as usize)
                .unwrap_or(defaults.max_tokens),
            temperature: parsed("BRANCHTALE_TEMPERATURE")
                .filter(|t| t.is_finite() && *t >= 0.0)
                .map(|t| t as f32)
                .unwrap_or(defaults.temperature),
            seed: defaults.seed,
        },
    })
}

#[cfg(not(feature = "llama"))]
fn gguf_backend(path: &str, _parsed: &dyn Fn(&str) -> Option<f64>) -> Result<BackendConfig> {
    bail!("{path}: this build has no local model support; rebuild with `--features llama`")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn http_backend_with_env_overrides() {
        let config = AppConfig::from_args(
            &args(&["http://localhost:1234", "/tmp/stories"]),
            env_from(&[
                ("BRANCHTALE_MODEL", "qwen"),
                ("BRANCHTALE_TIMEOUT_SECS", "30"),
                ("BRANCHTALE_MIN_PATH", "3"),
            ]),
        )
        .unwrap();

        let BackendConfig::Http(http) = &config.backend else {
            panic!("expected HTTP backend");
        };
        assert_eq!(http.model, "qwen");
        assert_eq!(http.timeout, Duration::from_secs(30));
        assert_eq!(http.temperature, HttpConfig::default().temperature);
        assert_eq!(config.storage, Storage::Dir(PathBuf::from("/tmp/stories")));
        assert_eq!(config.policy.min_path_len, 3);
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults() {
        let config = AppConfig::from_args(
            &args(&["http://localhost:1234"]),
            env_from(&[("BRANCHTALE_MIN_PATH", "lots"), ("BRANCHTALE_TIMEOUT_SECS", "-1")]),
        )
        .unwrap();

        assert_eq!(config.policy, NavigationPolicy::default());
        let BackendConfig::Http(http) = &config.backend else {
            panic!("expected HTTP backend");
        };
        assert_eq!(http.timeout, HttpConfig::default().timeout);
        assert_eq!(config.storage, Storage::Dir(JsonDirPersistence::default_dir()));
    }

    #[test]
    fn oversized_timeouts_fall_back_to_defaults() {
        for value in ["inf", "1e30", "NaN"] {
            let config = AppConfig::from_args(
                &args(&["http://localhost:1234"]),
                env_from(&[("BRANCHTALE_TIMEOUT_SECS", value)]),
            )
            .unwrap();
            let BackendConfig::Http(http) = &config.backend else {
                panic!("expected HTTP backend");
            };
            assert_eq!(http.timeout, HttpConfig::default().timeout, "for {value}");
        }
    }

    #[cfg(feature = "llama")]
    #[test]
    fn gguf_target_carries_sampling_settings() {
        let config = AppConfig::from_args(
            &args(&["model.gguf"]),
            env_from(&[("BRANCHTALE_TEMPERATURE", "0.3")]),
        )
        .unwrap();
        let BackendConfig::Llama { model, .. } = &config.backend else {
            panic!("expected llama backend");
        };
        assert_eq!(model.temperature, 0.3);
        assert_eq!(model.seed, ModelConfig::default().seed);
    }

    #[test]
    fn memory_storage_is_selectable() {
        let config =
            AppConfig::from_args(&args(&["http://localhost:1234", ":memory:"]), env_from(&[]))
                .unwrap();
        assert_eq!(config.storage, Storage::Memory);
    }

    #[test]
    fn missing_or_unknown_target_is_an_error() {
        assert!(AppConfig::from_args(&[], env_from(&[])).is_err());
        let err = AppConfig::from_args(&args(&["ftp://nope"]), env_from(&[])).unwrap_err();
        assert!(err.to_string().contains("unrecognised backend"));
    }
}
