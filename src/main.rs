use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use echoes::config::{GenerationParams, DEFAULT_MODEL_DIR};
use echoes::gemini::{GeminiClient, GeminiConfig, API_KEY_ENV, DEFAULT_BASE_URL, DEFAULT_MODEL};
use echoes::generate::SamplingConfig;
use echoes::refine::Refiner;
use echoes::sampler::{Sampler, SubprocessSampler};
use echoes::stage::{StagePlan, DEFAULT_DATASET, DEFAULT_RUN};
use echoes::workflow::{write_summary, Workflow};
use echoes::Runtime;

#[derive(Parser, Debug)]
#[command(
    name = "echoes",
    version,
    about = "Seed-token text generation with nanoGPT checkpoints and Gemini refinement"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Info, global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive prompt loop: tokenize, generate per piece, refine
    Run(RunArgs),
    /// Sample from a checkpoint directory and print the decoded text
    Sample(SampleArgs),
    /// Copy checkpoint and tokenizer files into the deployment tree
    Stage(StageArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Prompt used with --once
    #[arg(long, default_value = "ECHOES")]
    prompt: String,

    /// Echo refinement fragments to stderr as they stream in
    #[arg(long, default_value_t = false)]
    stream: bool,

    /// Process --prompt a single time instead of reading stdin
    #[arg(long, default_value_t = false)]
    once: bool,

    #[arg(long, default_value = DEFAULT_MODEL_DIR)]
    model_dir: PathBuf,

    /// cpu, cuda, cuda:N or mps; auto-detected when omitted
    #[arg(long)]
    device: Option<String>,

    #[arg(long, default_value_t = 1.0)]
    temperature: f64,

    #[arg(long, default_value_t = 150)]
    max_new_tokens: usize,

    /// Only used by the in-process sampler
    #[arg(long, default_value_t = 200)]
    top_k: usize,

    #[arg(long, value_enum, default_value_t = SamplerKind::InProcess)]
    sampler: SamplerKind,

    /// Program launched by the subprocess sampler (defaults to this binary)
    #[arg(long)]
    sampler_program: Option<PathBuf>,

    /// Argument placed before the sampling flags; repeatable
    #[arg(long, allow_hyphen_values = true)]
    sampler_arg: Vec<String>,

    #[arg(long, default_value = DEFAULT_MODEL)]
    gemini_model: String,

    #[arg(long, default_value = DEFAULT_BASE_URL)]
    gemini_url: String,

    #[arg(long, env = API_KEY_ENV, hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Args, Debug)]
struct SampleArgs {
    #[arg(long = "out_dir")]
    out_dir: Option<PathBuf>,
    #[arg(long)]
    device: Option<String>,
    #[arg(long)]
    temperature: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    start: Option<String>,
    #[arg(long = "num_samples")]
    num_samples: Option<usize>,
    #[arg(long = "max_new_tokens")]
    max_new_tokens: Option<usize>,
    #[arg(long = "top_k")]
    top_k: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
}

impl SampleArgs {
    fn into_params(self) -> GenerationParams {
        let d = GenerationParams::default();
        GenerationParams {
            out_dir: self.out_dir.unwrap_or(d.out_dir),
            device: self.device.or(d.device),
            start: self.start.unwrap_or(d.start),
            num_samples: self.num_samples.unwrap_or(d.num_samples),
            max_new_tokens: self.max_new_tokens.unwrap_or(d.max_new_tokens),
            temperature: self.temperature.unwrap_or(d.temperature),
            top_k: self.top_k.or(d.top_k),
            seed: self.seed.unwrap_or(d.seed),
        }
    }
}

#[derive(Args, Debug)]
struct StageArgs {
    /// Directory holding both the nanoGPT and piGPT trees
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    /// Training output directory under nanoGPT/
    #[arg(long, default_value = DEFAULT_RUN)]
    run: String,

    /// Dataset directory under nanoGPT/data/
    #[arg(long, default_value = DEFAULT_DATASET)]
    dataset: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SamplerKind {
    InProcess,
    Subprocess,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(Level::from(cli.log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run(args) => run(args),
        Command::Sample(args) => {
            let params = args.into_params();
            echoes::run_sample(&params, &mut std::io::stdout().lock())
        }
        Command::Stage(args) => {
            let plan = StagePlan::for_project(&args.project_root, &args.run, &args.dataset);
            let report = echoes::stage::run(&plan)?;
            info!(
                copied = report.copied.len(),
                skipped = report.skipped.len(),
                "deployment files staged into {:?}",
                plan.dst_model_dir
            );
            Ok(())
        }
    }
}

fn run(args: RunArgs) -> Result<()> {
    let tokenizer = echoes::tokenizer::load_workflow_tokenizer(&args.model_dir)?;

    let mut gemini = GeminiConfig::new(args.api_key.unwrap_or_default());
    gemini.model = args.gemini_model;
    gemini.base_url = args.gemini_url;
    let mut refiner = Refiner::new(Box::new(GeminiClient::new(gemini)?));
    if args.stream {
        refiner = refiner.with_echo(Box::new(|fragment: &str| eprint!("{fragment}")));
    }

    let rt = Runtime::from_option(args.device.as_deref())?;
    let sampler: Box<dyn Sampler> = match args.sampler {
        SamplerKind::InProcess => Box::new(echoes::load_in_process_sampler(
            &args.model_dir,
            &rt,
            args.max_new_tokens,
            SamplingConfig {
                temperature: args.temperature,
                top_k: Some(args.top_k),
            },
        )?),
        SamplerKind::Subprocess => {
            let workdir = std::env::current_dir().context("current dir")?;
            let mut s = SubprocessSampler::current_exe(
                &workdir,
                &args.model_dir,
                &rt.name,
                args.temperature,
                args.max_new_tokens,
            )?;
            if let Some(program) = args.sampler_program {
                s.program = program;
                s.prefix_args = args.sampler_arg;
            }
            Box::new(s)
        }
    };

    let mut workflow = Workflow::new(Box::new(tokenizer), sampler, refiner);
    info!("ready (device: {})", rt.name);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut summary = std::io::stderr();
    if args.once {
        let refined = workflow.process_prompt(&args.prompt, &mut out)?;
        write_summary(&refined, &mut summary)?;
        return Ok(());
    }
    workflow.run_interactive(std::io::stdin().lock(), &mut out, &mut summary)
}
