use std::path::PathBuf;

use candle_core::{Device, Tensor};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nano_decode::core::pages_for_tokens;
use nano_decode::engine::SamplingScorer;
use nano_decode::{
    BeamGroup, DecodeConfig, Error, ExecRequest, InputBatch, ModelParams, QueueConfig, RequestId,
    RequestQueueManager, Responder, Result, SharedPageStore,
};

#[derive(Parser, Debug)]
#[command(name = "nano-decode")]
#[command(about = "Simulate decode-time scheduling against random logits")]
struct Args {
    /// Model parameters JSON file
    #[arg(long)]
    model_params: Option<PathBuf>,

    /// Number of requests to submit
    #[arg(short, long, default_value = "4")]
    requests: usize,

    /// Prompt length in tokens
    #[arg(long, default_value = "16")]
    prompt_len: usize,

    /// Maximum tokens to generate per beam
    #[arg(long, default_value = "32")]
    max_tokens: usize,

    /// Number of beams per request
    #[arg(long, default_value = "1")]
    num_beams: usize,

    /// Use beam search instead of independent sampling
    #[arg(long)]
    beam_search: bool,

    /// Sampling temperature
    #[arg(long, default_value = "1.0")]
    temperature: f32,

    /// Top-p threshold (1.0 disables)
    #[arg(long, default_value = "1.0")]
    top_p: f32,

    /// Vocabulary size of the simulated backend
    #[arg(long, default_value = "256")]
    vocab_size: usize,

    /// End-of-sequence token
    #[arg(long, default_value = "0")]
    eos_token_id: u32,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,
}

/// Writes responses to the log.
struct LogResponder;

impl Responder for LogResponder {
    fn send_error(&self, error: &Error) {
        if error.is_admission_rejection() {
            warn!(%error, "request rejected");
        } else {
            error!(%error, "invalid request");
        }
    }

    fn send_response(&self, request_id: RequestId, results: &[Vec<u32>]) {
        for (rank, tokens) in results.iter().enumerate() {
            info!(request_id, rank, len = tokens.len(), "result {:?}", tokens);
        }
    }
}

fn load_model_params(args: &Args) -> Result<ModelParams> {
    match &args.model_params {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("failed to read {}: {e}", path.display()))
            })?;
            ModelParams::from_json(&json)
        }
        None => Ok(ModelParams::default()),
    }
}

fn random_logits(rng: &mut StdRng, vocab_size: usize) -> Result<Tensor> {
    let values: Vec<f32> = (0..vocab_size).map(|_| rng.gen_range(-4.0..4.0)).collect();
    Ok(Tensor::from_vec(values, vocab_size, &Device::Cpu)?)
}

/// Drive one admitted request to completion.
async fn run_request(
    request_id: RequestId,
    prompt: Vec<u32>,
    config: DecodeConfig,
    store: &SharedPageStore,
    params: &ModelParams,
    rng: &mut StdRng,
    args: &Args,
) -> Result<Vec<Vec<u32>>> {
    let pages = pages_for_tokens(
        prompt.len() + config.max_completion_tokens,
        params.block_seq_stride(),
    );
    let exec_req = ExecRequest::new(prompt, store.allocate(pages)?);
    let mut group = BeamGroup::from_exec_request(config.clone(), exec_req)?;
    if !config.use_beam_search && (config.top_k().is_some() || config.top_p().is_some()) {
        group.set_scorer(Box::new(SamplingScorer::with_seed(args.seed ^ request_id)));
    }

    let mut steps = 0;
    while !group.is_finished() {
        for beam in group.active_beams_mut() {
            beam.exec_req_mut()
                .set_result_logits(random_logits(rng, args.vocab_size)?);
        }
        let report = group.process_beams()?;
        for (beam_id, error) in &report.failures {
            warn!(request_id, beam = beam_id, %error, "sampling failed");
        }
        steps += 1;
    }

    for beam in group.completed_beams() {
        beam.exec_req().done().set_success()?;
    }
    group.wait().await;

    let results = group.results();
    let released = group.clean_up()?;
    info!(request_id, steps, released, "request finished");
    Ok(results)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nano_decode=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let params = load_model_params(&args)?;
    let store = SharedPageStore::new(params.paged_kv_cache.device_block_count);
    let mut queue = RequestQueueManager::new(params.clone(), QueueConfig::default());
    let mut rng = StdRng::seed_from_u64(args.seed);

    info!(
        pages = store.num_pages(),
        page_bytes = params.page_size_bytes(),
        "nano-decode v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = DecodeConfig {
        num_beams: args.num_beams,
        top_k: params.top_k,
        top_p: args.top_p,
        temperature: args.temperature,
        use_beam_search: args.beam_search,
        max_completion_tokens: args.max_tokens,
        eos_token_id: Some(args.eos_token_id),
        ..Default::default()
    };

    let responder = LogResponder;
    let mut admitted = Vec::new();
    for _ in 0..args.requests {
        let prompt: Vec<u32> = (0..args.prompt_len)
            .map(|_| rng.gen_range(1..args.vocab_size.max(2) as u32))
            .collect();
        let batch = InputBatch::Pretokenized(vec![prompt.clone()]);
        if let Some(request_id) = queue.add_to_queue(vec![config.clone()], batch, &responder) {
            admitted.push((request_id, prompt));
        }
    }
    info!(
        admitted = admitted.len(),
        available = queue.available_page_count(),
        "admission done"
    );

    for (request_id, prompt) in admitted {
        let results =
            run_request(request_id, prompt, config.clone(), &store, &params, &mut rng, &args)
                .await?;
        responder.send_response(request_id, &results);
        queue.remove_from_queue(request_id)?;
    }

    info!(
        free = store.num_free_pages(),
        total = store.num_pages(),
        releases = store.num_releases(),
        available = queue.available_page_count(),
        "all requests done"
    );
    Ok(())
}
