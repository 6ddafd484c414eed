#![allow(dead_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use echoes::refine::{GenerativeBackend, RefineError};
use echoes::sampler::SubprocessSampler;
use echoes::tokenizer::PieceTokenizer;

/// Directory holding `ckpt.pt`, `meta.pkl` and a SentencePiece model.
pub fn maybe_model_dir() -> Option<PathBuf> {
    std::env::var_os("ECHOES_MODEL_DIR").map(PathBuf::from)
}

pub fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {parent:?}"))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("write {path:?}"))
}

/// Sampler running `sh -c script`; the sampling flags land in `$1..$7`.
pub fn shell_sampler(script: &str, workdir: &Path) -> SubprocessSampler {
    SubprocessSampler {
        program: PathBuf::from("sh"),
        prefix_args: vec!["-c".into(), script.into(), "sampler".into()],
        workdir: workdir.to_path_buf(),
        out_dir: PathBuf::from("models"),
        device: "cpu".into(),
        temperature: 1.0,
        max_new_tokens: 150,
    }
}

/// Whitespace split with a SentencePiece-style word marker.
pub struct WordPieces;

impl PieceTokenizer for WordPieces {
    fn pieces(&self, text: &str) -> Result<Vec<String>> {
        Ok(text.split_whitespace().map(|w| format!("▁{w}")).collect())
    }
}

/// Upper-cases the raw text quoted in the correction prompt.
pub struct ShoutingBackend;

impl GenerativeBackend for ShoutingBackend {
    fn stream_generate(
        &self,
        prompt: &str,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<(), RefineError> {
        let raw = prompt
            .lines()
            .find_map(|ln| ln.strip_prefix("원본: "))
            .unwrap_or_default();
        for word in raw.split_inclusive(' ') {
            on_fragment(&word.to_uppercase());
        }
        Ok(())
    }
}
