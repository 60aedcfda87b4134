mod config;
mod error;
mod llm;
mod persist;
mod session;
mod story;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info};

use config::{AppConfig, BackendConfig, Storage};
use llm::http::HttpBackend;
use llm::{Generator, PromptGenerator};
use persist::{JsonDirPersistence, MemoryPersistence, Persistence};
use story::navigator::Navigator;
use story::store::StoryStore;

fn build_generator(backend: &BackendConfig) -> Result<Box<dyn Generator>> {
    match backend {
        BackendConfig::Http(http) => {
            println!("Using chat endpoint: {}", http.endpoint);
            println!("  Model       : {}", http.model);
            println!("  Temperature : {}", http.temperature);
            let backend = HttpBackend::new(http.clone())?;
            Ok(Box::new(PromptGenerator::new(backend)))
        }
        #[cfg(feature = "llama")]
        BackendConfig::Llama { model_path, model } => {
            println!("Loading model: {model_path}");
            println!("  GPU layers : {}", model.n_gpu_layers);
            println!("  Context    : {}", model.n_ctx);
            println!("  Max tokens : {}", model.max_tokens);
            println!("  Temperature: {}", model.temperature);
            let backend = llm::llama::LlamaBackend::load(model_path, model.clone())
                .context("failed to load model")?;
            Ok(Box::new(PromptGenerator::new(backend)))
        }
    }
}

fn build_persistence(storage: &Storage) -> Result<Box<dyn Persistence>> {
    match storage {
        Storage::Dir(dir) => {
            let persistence = JsonDirPersistence::open(dir)?;
            println!("Stories are kept in: {}", persistence.dir().display());
            Ok(Box::new(persistence))
        }
        Storage::Memory => {
            println!("Stories are kept in memory and lost on exit.");
            Ok(Box::new(MemoryPersistence::new()))
        }
    }
}

fn main() -> Result<()> {
    // Initialize logging. Control verbosity with RUST_LOG env var:
    //   RUST_LOG=info   branchtale http://localhost:1234   # branches + lifecycle
    //   RUST_LOG=debug  branchtale http://localhost:1234   # + prompts and parsed JSON
    //   RUST_LOG=trace  branchtale http://localhost:1234   # + raw model output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = AppConfig::from_args(&args, |key| std::env::var(key).ok())?;

    let persistence =
        build_persistence(&config.storage).context("failed to open story storage")?;
    let generator = build_generator(&config.backend)?;
    let store = Arc::new(StoryStore::new(persistence));
    store.subscribe(|event| {
        debug!(
            "story {} is now at version {} ({:?})",
            event.story_id, event.version, event.kind
        );
    });

    let navigator = Navigator::new(store, generator, config.policy);
    info!(
        "Stories can be ended after {} parts",
        config.policy.min_path_len
    );

    session::run(&navigator, &config.layout)
}
