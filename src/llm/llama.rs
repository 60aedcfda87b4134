use std::num::NonZeroU32;
use std::pin::pin;
use std::sync::mpsc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, trace};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend as Backend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;

use crate::llm::{ChatBackend, ChatMessage};

// ---------------------------------------------------------------------------
// Model configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// How many layers to offload to GPU (0 = CPU only).
    pub n_gpu_layers: u32,
    /// Context window size in tokens.
    pub n_ctx: u32,
    /// Maximum tokens to generate per completion.
    pub max_tokens: usize,
    pub temperature: f32,
    /// Sampler seed; a fixed seed makes replies reproducible for a given prompt.
    pub seed: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_gpu_layers: 0,
            n_ctx: 8192,
            max_tokens: 1024,
            temperature: 0.8,
            seed: 1234,
        }
    }
}

impl ModelConfig {
    /// Repetition penalty over the last 64 tokens, then top-k and top-p,
    /// then temperature.
    fn sampler(&self) -> LlamaSampler {
        LlamaSampler::chain_simple([
            LlamaSampler::penalties(64, 1.1, 0.0, 0.0),
            LlamaSampler::top_k(40),
            LlamaSampler::top_p(0.95, 1),
            LlamaSampler::temp(self.temperature),
            LlamaSampler::dist(self.seed),
        ])
    }
}

// ---------------------------------------------------------------------------
// Worker-side model handle
// ---------------------------------------------------------------------------

struct LoadedModel {
    model: &'static LlamaModel,
    ctx: LlamaContext<'static>,
    config: ModelConfig,
}

impl LoadedModel {
    fn load(model_path: &str, config: ModelConfig) -> Result<Self> {
        let backend: &'static Backend = Box::leak(Box::new(
            Backend::init().context("failed to init llama backend")?,
        ));

        info!(
            "Loading {model_path} (gpu layers {}, context {}, max tokens {}, temperature {})",
            config.n_gpu_layers, config.n_ctx, config.max_tokens, config.temperature
        );

        let params = pin!(LlamaModelParams::default().with_n_gpu_layers(config.n_gpu_layers));
        let model: &'static LlamaModel = Box::leak(Box::new(
            LlamaModel::load_from_file(backend, model_path, &params)
                .with_context(|| format!("failed to load {model_path}"))?,
        ));

        let n_ctx = NonZeroU32::new(config.n_ctx).context("context size must be > 0")?;
        let ctx = model
            .new_context(backend, LlamaContextParams::default().with_n_ctx(Some(n_ctx)))
            .context("failed to create inference context")?;

        info!("Model ready");
        Ok(Self { model, ctx, config })
    }

    /// Render the conversation with the model's own chat template.
    fn render(&self, messages: &[ChatMessage]) -> Result<String> {
        let chat = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.clone(), m.content.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("message contains an interior NUL")?;
        let template = self
            .model
            .chat_template(None)
            .context("model has no chat template")?;
        self.model
            .apply_chat_template(&template, &chat, true)
            .context("failed to apply chat template")
    }

    /// Decode the whole prompt through `batch`, leaving its last logits ready
    /// for the first sampled token.
    fn prefill(&mut self, prompt: &str, batch: &mut LlamaBatch) -> Result<()> {
        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .context("tokenization failed")?;
        let Some(last) = tokens.len().checked_sub(1) else {
            bail!("prompt produced no tokens");
        };
        if tokens.len() >= self.config.n_ctx as usize {
            bail!(
                "prompt is {} tokens but the context holds {}",
                tokens.len(),
                self.config.n_ctx
            );
        }
        debug!("Prompt is {} tokens", tokens.len());

        for (i, token) in tokens.iter().enumerate() {
            batch.add(*token, i as i32, &[0], i == last)?;
        }
        self.ctx.decode(batch).context("prompt decode failed")
    }

    fn generate(&mut self, messages: &[ChatMessage]) -> Result<String> {
        self.ctx.clear_kv_cache();
        let prompt = self.render(messages)?;
        trace!("Rendered prompt:\n{prompt}");

        let mut batch = LlamaBatch::new(self.config.n_ctx as usize, 1);
        self.prefill(&prompt, &mut batch)?;
        let mut position = batch.n_tokens();
        // Never sample past the end of the context window.
        let room = self.config.n_ctx as usize - position as usize;
        let budget = self.config.max_tokens.min(room);
        let mut sampler = self.config.sampler();
        let mut utf8 = encoding_rs::UTF_8.new_decoder();
        let mut reply = String::new();

        for _ in 0..budget {
            let token = sampler.sample(&self.ctx, batch.n_tokens() - 1);
            sampler.accept(token);
            if self.model.is_eog_token(token) {
                break;
            }
            reply.push_str(
                &self
                    .model
                    .token_to_piece(token, &mut utf8, true, None)
                    .context("failed to detokenize")?,
            );

            batch.clear();
            batch.add(token, position, &[0], true)?;
            self.ctx.decode(&mut batch).context("decode step failed")?;
            position += 1;
        }

        trace!("Raw reply ({} bytes):\n{reply}", reply.len());
        Ok(reply)
    }
}

// ---------------------------------------------------------------------------
// Thread-safe front
// ---------------------------------------------------------------------------

type Request = (Vec<ChatMessage>, mpsc::Sender<Result<String>>);

/// A local GGUF model. The llama.cpp context is not thread-safe, so it lives
/// on a dedicated worker thread and requests are queued to it.
pub struct LlamaBackend {
    requests: mpsc::Sender<Request>,
}

impl LlamaBackend {
    pub fn load(model_path: &str, config: ModelConfig) -> Result<Self> {
        let (requests, inbox) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let path = model_path.to_string();

        thread::Builder::new()
            .name("llama-worker".into())
            .spawn(move || {
                let mut model = match LoadedModel::load(&path, config) {
                    Ok(model) => {
                        let _ = ready_tx.send(Ok(()));
                        model
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                for (messages, reply) in inbox {
                    let _ = reply.send(model.generate(&messages));
                }
                debug!("llama worker shutting down");
            })
            .context("failed to spawn llama worker thread")?;

        ready_rx
            .recv()
            .context("llama worker exited during start-up")??;
        Ok(Self { requests })
    }
}

impl ChatBackend for LlamaBackend {
    fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.requests
            .send((messages.to_vec(), reply_tx))
            .map_err(|_| anyhow!("llama worker is gone"))?;
        reply_rx
            .recv()
            .context("llama worker dropped the request")?
    }
}
