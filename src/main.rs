use std::{io::Write, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use token_lens::{
    AnalysisOrchestrator, AnalysisRun, AnalysisTrigger, AppConfig, AppState, GenerationConsumer,
    HttpGateway, InferenceGateway, SamplingConfig, SessionState,
    sampling::Preset,
    stats::display_token,
};

#[derive(Parser)]
#[command(name = "tokenlens", about = "Inspect how a language model reads and writes text")]
struct Cli {
    /// Base URL of the inference service.
    #[arg(long, env = "TOKENLENS_BASE_URL", global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Tokenize, embed, attend and score the next token for a prompt.
    Analyze(SamplingArgs),
    /// Stream an autoregressive continuation of a prompt.
    Generate(SamplingArgs),
    /// Read prompts from stdin, one per line, analyzing once typing settles.
    Watch(SamplingArgs),
    /// Show which model the service runs.
    Info,
}

#[derive(Clone, Copy, ValueEnum)]
enum PresetArg {
    Precise,
    Creative,
}

#[derive(Args)]
struct SamplingArgs {
    prompt: Option<String>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long)]
    top_k: Option<u32>,
    #[arg(long)]
    top_p: Option<f64>,
    #[arg(long)]
    max_new_tokens: Option<u32>,
    #[arg(long, value_enum)]
    preset: Option<PresetArg>,
    /// Disable sampling.
    #[arg(long)]
    greedy: bool,
}

impl SamplingArgs {
    fn apply(&self, base: &SamplingConfig) -> SamplingConfig {
        let mut config = base.clone();
        if let Some(preset) = self.preset {
            config.apply_preset(match preset {
                PresetArg::Precise => Preset::Precise,
                PresetArg::Creative => Preset::Creative,
            });
        }
        if let Some(prompt) = &self.prompt {
            config.prompt = prompt.clone();
        }
        config.temperature = self.temperature.unwrap_or(config.temperature);
        config.top_k = self.top_k.unwrap_or(config.top_k);
        config.top_p = self.top_p.unwrap_or(config.top_p);
        config.max_new_tokens = self.max_new_tokens.unwrap_or(config.max_new_tokens);
        if self.greedy {
            config.sample = false;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url.trim_end_matches('/').to_string();
    }
    tracing::info!(base_url = %config.base_url, "using inference service");

    let gateway: Arc<dyn InferenceGateway> = Arc::new(HttpGateway::new(&config)?);
    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        gateway.clone(),
        config.top_k_mass,
    ));

    match cli.command {
        Command::Analyze(args) => {
            let mut state = AppState::new(args.apply(&config.sampling), config.auto_analyze);
            let run = orchestrator.run(&state.config).await?;
            state.apply_run(&run);
            print_run(&state, &run)?;
        }
        Command::Generate(args) => {
            let sampling = args.apply(&config.sampling);
            let consumer = Arc::new(GenerationConsumer::new(gateway, config.stream_idle_timeout));
            generate(consumer, sampling).await?;
        }
        Command::Watch(args) => {
            let base = args.apply(&config.sampling);
            watch(orchestrator, &config, base).await?;
        }
        Command::Info => {
            let info = orchestrator.model_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
    }

    Ok(())
}

fn print_run(state: &AppState, run: &AnalysisRun) -> anyhow::Result<()> {
    let overview = state.overview().unwrap_or_default();
    println!("focus: {}", state.current_step);
    println!("{}", serde_json::to_string_pretty(&overview)?);
    println!("{}", serde_json::to_string_pretty(&run.snapshot.annotations)?);
    for error in &run.errors {
        eprintln!("warning: {error}");
    }
    Ok(())
}

async fn generate(
    consumer: Arc<GenerationConsumer>,
    sampling: SamplingConfig,
) -> anyhow::Result<()> {
    let session = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.generate(&sampling).await }
    });

    let mut printed = 0;
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => consumer.cancel(),
            _ = ticker.tick() => {}
        }
        let view = consumer.view();
        for token in view.ledger.tokens().skip(printed) {
            print!("{}", display_token(token));
        }
        printed = view.ledger.len();
        std::io::stdout().flush()?;
        if view.state.is_terminal() || session.is_finished() {
            break;
        }
    }
    println!();

    let summary = session.await??;
    if summary.state == SessionState::Aborted {
        if let Some(err) = &summary.error {
            eprintln!("generation aborted: {err}");
        }
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn watch(
    orchestrator: Arc<AnalysisOrchestrator>,
    config: &AppConfig,
    base: SamplingConfig,
) -> anyhow::Result<()> {
    let (trigger, mut outcomes) = AnalysisTrigger::new(orchestrator, config);
    let mut state = AppState::new(base, trigger.auto_analyze());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                state.config.prompt = line;
                trigger.on_prompt_changed(&state.config);
            }
            Some(outcome) = outcomes.recv() => report(&mut state, outcome)?,
        }
    }

    // Input closed: analyze the last edit now and wait for runs still in flight.
    if let Some(outcome) = trigger.flush_pending(&state.config).await {
        report(&mut state, outcome)?;
    }
    drop(trigger);
    while let Some(outcome) = outcomes.recv().await {
        report(&mut state, outcome)?;
    }
    Ok(())
}

fn report(state: &mut AppState, outcome: token_lens::Result<AnalysisRun>) -> anyhow::Result<()> {
    match outcome {
        Ok(run) => {
            state.apply_run(&run);
            print_run(state, &run)?;
        }
        Err(err) if err.is_user_visible() => eprintln!("analysis failed: {err}"),
        Err(err) => tracing::warn!(%err, "analysis failed"),
    }
    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,reqwest=warn,hyper=warn".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
