use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::generate::{generate, SamplingConfig};
use crate::model::NanoGpt;
use crate::tokenizer::TextTokenizer;

/// Header nanoGPT prints when it builds a model.
const PARAMS_HEADER: &str = "number of parameters";

/// Produces raw text continuing one seed token. Failures are logged and
/// surface as an empty string.
pub trait Sampler {
    fn generate(&mut self, seed_token: &str) -> String;
}

/// First non-blank line that is not the parameter-count header, trimmed.
pub fn first_meaningful_line(output: &str) -> String {
    output
        .lines()
        .filter(|ln| !ln.trim().is_empty())
        .find(|ln| !ln.to_lowercase().starts_with(PARAMS_HEADER))
        .map(|ln| ln.trim().to_string())
        .unwrap_or_default()
}

/// Keeps the model and tokenizer resident and samples in-process.
pub struct InProcessSampler {
    model: NanoGpt,
    tokenizer: TextTokenizer,
    max_new_tokens: usize,
    sampling: SamplingConfig,
}

impl InProcessSampler {
    pub fn new(
        model: NanoGpt,
        tokenizer: TextTokenizer,
        max_new_tokens: usize,
        sampling: SamplingConfig,
    ) -> Self {
        Self {
            model,
            tokenizer,
            max_new_tokens,
            sampling,
        }
    }

    /// Full decoded sample (prompt included) for `start` under `seed`.
    pub fn sample_text(&self, start: &str, seed: u64) -> Result<String> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut ids = self.tokenizer.encode_start(start);
        generate(
            &self.model,
            &mut ids,
            self.max_new_tokens,
            self.sampling,
            &mut rng,
        )
        .context("generate")?;
        self.tokenizer.decode(&ids).context("decode")
    }
}

impl Sampler for InProcessSampler {
    fn generate(&mut self, seed_token: &str) -> String {
        if seed_token.trim().is_empty() {
            return String::new();
        }
        let seed: u32 = rand::thread_rng().gen();
        debug!(seed_token, seed, "sampling in-process");
        match self.sample_text(seed_token, u64::from(seed)) {
            Ok(text) => first_meaningful_line(&text),
            Err(err) => {
                error!("sampling failed for {seed_token:?}: {err:#}");
                String::new()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("failed to launch {program:?}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sampler exited with {status}: {stderr}")]
    Exit {
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Launches one sampling process per seed token.
#[derive(Debug, Clone)]
pub struct SubprocessSampler {
    pub program: PathBuf,
    /// Arguments placed before the sampling flags, e.g. `sample` or a script path.
    pub prefix_args: Vec<String>,
    pub workdir: PathBuf,
    pub out_dir: PathBuf,
    pub device: String,
    pub temperature: f64,
    pub max_new_tokens: usize,
}

impl SubprocessSampler {
    /// Calls back into this executable's `sample` subcommand.
    pub fn current_exe(
        workdir: &Path,
        out_dir: &Path,
        device: &str,
        temperature: f64,
        max_new_tokens: usize,
    ) -> Result<Self> {
        let program = std::env::current_exe().context("locate current executable")?;
        Ok(Self {
            program,
            prefix_args: vec!["sample".to_string()],
            workdir: workdir.to_path_buf(),
            out_dir: out_dir.to_path_buf(),
            device: device.to_string(),
            temperature,
            max_new_tokens,
        })
    }

    pub fn command_args(&self, seed_token: &str, seed: u32) -> Vec<String> {
        let mut args = self.prefix_args.clone();
        args.extend([
            format!("--out_dir={}", self.out_dir.display()),
            format!("--device={}", self.device),
            format!("--temperature={}", self.temperature),
            format!("--start={seed_token}"),
            "--num_samples=1".to_string(),
            format!("--max_new_tokens={}", self.max_new_tokens),
            format!("--seed={seed}"),
        ]);
        args
    }

    pub fn run(&self, seed_token: &str, seed: u32) -> Result<String, SampleError> {
        let output = Command::new(&self.program)
            .args(self.command_args(seed_token, seed))
            .current_dir(&self.workdir)
            .env("PYTHONUTF8", "1")
            .output()
            .map_err(|source| SampleError::Launch {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(SampleError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(first_meaningful_line(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl Sampler for SubprocessSampler {
    fn generate(&mut self, seed_token: &str) -> String {
        if seed_token.trim().is_empty() {
            return String::new();
        }
        let seed: u32 = rand::thread_rng().gen();
        debug!(seed_token, seed, program = ?self.program, "launching sampler");
        match self.run(seed_token, seed) {
            Ok(text) => text,
            Err(err) => {
                warn!("sampler error: {err}");
                String::new()
            }
        }
    }
}
