use std::path::Path;

use anyhow::{bail, Context, Result};
use sentencepiece::SentencePieceProcessor;
use tiktoken_rs::{r50k_base, CoreBPE};
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::config::{BPE_TOKENIZER_FILE, META_FILE};
use crate::meta::{load_meta, resolve_sp_model};

/// Splits a prompt into subword pieces.
pub trait PieceTokenizer {
    fn pieces(&self, text: &str) -> Result<Vec<String>>;
}

pub struct SpTokenizer {
    inner: SentencePieceProcessor,
}

impl SpTokenizer {
    pub fn open(path: &Path) -> Result<Self> {
        let inner = SentencePieceProcessor::open(path)
            .with_context(|| format!("load SentencePiece model {path:?}"))?;
        Ok(Self { inner })
    }
}

impl PieceTokenizer for SpTokenizer {
    fn pieces(&self, text: &str) -> Result<Vec<String>> {
        let pieces = self.inner.encode(text).context("sentencepiece encode")?;
        Ok(pieces.into_iter().map(|p| p.piece).collect())
    }
}

/// Loads the SentencePiece model named by `meta.pkl` in `model_dir`.
/// Unlike the sampler, the workflow cannot run without it.
pub fn load_workflow_tokenizer(model_dir: &Path) -> Result<SpTokenizer> {
    let meta_path = model_dir.join(META_FILE);
    if !meta_path.exists() {
        bail!("meta.pkl not found: {meta_path:?}");
    }
    let meta = load_meta(&meta_path)?;
    if !meta.has_sp_model_path() {
        bail!("sp_model_path not in {meta_path:?}");
    }
    let Some(sp_path) = resolve_sp_model(&meta_path, &meta)? else {
        bail!("SentencePiece model file not found next to {meta_path:?}");
    };
    debug!(path = ?sp_path, vocab_size = ?meta.vocab_size, "loading SentencePiece model");
    SpTokenizer::open(&sp_path)
}

/// Tokenizer used by the sampler: SentencePiece when the model directory
/// provides one, then a `tokenizer.json` override, then the built-in GPT-2
/// byte-pair encoding.
pub enum TextTokenizer {
    SentencePiece(SentencePieceProcessor),
    Bpe(Tokenizer),
    Gpt2(CoreBPE),
}

impl TextTokenizer {
    pub fn load(model_dir: &Path) -> Result<Self> {
        if let Some(sp) = try_sentencepiece(model_dir)? {
            return Ok(Self::SentencePiece(sp));
        }
        let tok_json = model_dir.join(BPE_TOKENIZER_FILE);
        if tok_json.exists() {
            debug!("loading byte-pair tokenizer from {tok_json:?}");
            let inner = Tokenizer::from_file(&tok_json)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .with_context(|| format!("load {tok_json:?}"))?;
            return Ok(Self::Bpe(inner));
        }
        warn!("no SentencePiece model in {model_dir:?}, falling back to GPT-2 encoding");
        Self::gpt2()
    }

    pub fn gpt2() -> Result<Self> {
        Ok(Self::Gpt2(r50k_base().context("build GPT-2 encoding")?))
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        match self {
            Self::SentencePiece(sp) => Ok(sp
                .encode(text)
                .context("sentencepiece encode")?
                .into_iter()
                .map(|p| p.id)
                .collect()),
            Self::Bpe(tok) => {
                let enc = tok.encode(text, false).map_err(|e| anyhow::anyhow!("{e}"))?;
                Ok(enc.get_ids().to_vec())
            }
            Self::Gpt2(bpe) => Ok(bpe
                .encode_ordinary(text)
                .into_iter()
                .map(|id| id as u32)
                .collect()),
        }
    }

    /// Encodes the start text, never returning an empty sequence: a text
    /// that encodes to nothing is looked up as a single piece, else id 0.
    pub fn encode_start(&self, text: &str) -> Vec<u32> {
        match self.encode(text) {
            Ok(ids) if !ids.is_empty() => return ids,
            Ok(_) => {}
            Err(err) => warn!("encode start text failed: {err:#}"),
        }
        let piece_id = match self {
            Self::SentencePiece(sp) => sp.piece_to_id(text).ok().flatten(),
            Self::Bpe(tok) => tok.token_to_id(text),
            Self::Gpt2(_) => None,
        };
        vec![piece_id.unwrap_or(0)]
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        match self {
            Self::SentencePiece(sp) => sp.decode_piece_ids(ids).context("sentencepiece decode"),
            Self::Bpe(tok) => tok.decode(ids, true).map_err(|e| anyhow::anyhow!("{e}")),
            Self::Gpt2(bpe) => bpe
                .decode(ids.iter().map(|&id| id as _).collect())
                .context("gpt2 decode"),
        }
    }
}

fn try_sentencepiece(model_dir: &Path) -> Result<Option<SentencePieceProcessor>> {
    let meta_path = model_dir.join(META_FILE);
    if !meta_path.exists() {
        return Ok(None);
    }
    let meta = match load_meta(&meta_path) {
        Ok(meta) => meta,
        Err(err) => {
            warn!("ignoring unreadable {meta_path:?}: {err:#}");
            return Ok(None);
        }
    };
    let Some(sp_path) = resolve_sp_model(&meta_path, &meta)? else {
        return Ok(None);
    };
    match SentencePieceProcessor::open(&sp_path) {
        Ok(sp) => Ok(Some(sp)),
        Err(err) => {
            warn!("failed to load {sp_path:?}: {err}");
            Ok(None)
        }
    }
}
