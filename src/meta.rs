//! `meta.pkl` lookup and SentencePiece model resolution.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_pickle::{DeOptions, HashableValue, Value};

use crate::config::SP_MODEL_EXT;

/// Tokenizer metadata written next to the training data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenizerMeta {
    /// `None` when the key is absent, `Some(None)` when it is present but empty.
    pub sp_model_path: Option<Option<String>>,
    pub vocab_size: Option<u64>,
}

impl TokenizerMeta {
    pub fn has_sp_model_path(&self) -> bool {
        self.sp_model_path.is_some()
    }
}

pub fn load_meta(path: &Path) -> Result<TokenizerMeta> {
    let bytes = std::fs::read(path).with_context(|| format!("read {path:?}"))?;
    parse_meta(&bytes).with_context(|| format!("parse {path:?}"))
}

pub fn parse_meta(bytes: &[u8]) -> Result<TokenizerMeta> {
    let value = serde_pickle::value_from_slice(bytes, DeOptions::new().replace_unresolved_globals())
        .context("unpickle")?;
    let Value::Dict(dict) = value else {
        bail!("meta is not a dict");
    };
    let get = |key: &str| dict.get(&HashableValue::String(key.to_string()));

    let sp_model_path = match get("sp_model_path") {
        None => None,
        Some(Value::String(s)) if !s.is_empty() => Some(Some(s.clone())),
        Some(Value::String(_)) | Some(Value::None) => Some(None),
        Some(other) => bail!("sp_model_path is not a string: {other:?}"),
    };
    let vocab_size = match get("vocab_size") {
        Some(Value::I64(n)) => u64::try_from(*n).ok(),
        _ => None,
    };
    Ok(TokenizerMeta {
        sp_model_path,
        vocab_size,
    })
}

/// Resolves the SentencePiece model referenced by `meta`, relative paths
/// against the directory holding `meta.pkl`. Falls back to the first
/// `*.model` in that directory when the reference is unset or dangling.
pub fn resolve_sp_model(meta_path: &Path, meta: &TokenizerMeta) -> Result<Option<PathBuf>> {
    let meta_dir = meta_path.parent().unwrap_or_else(|| Path::new("."));
    if let Some(Some(p)) = &meta.sp_model_path {
        let p = PathBuf::from(p);
        let p = if p.is_absolute() { p } else { meta_dir.join(p) };
        if p.exists() {
            return Ok(Some(p));
        }
    }
    find_sp_model(meta_dir)
}

pub fn find_sp_model(dir: &Path) -> Result<Option<PathBuf>> {
    let mut found = vec![];
    for entry in std::fs::read_dir(dir).with_context(|| format!("read_dir {dir:?}"))? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some(SP_MODEL_EXT) {
            found.push(path);
        }
    }
    // read_dir order is platform dependent
    found.sort();
    Ok(found.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_pickle::SerOptions;
    use tempfile::tempdir;

    #[derive(Serialize)]
    struct Meta<'a> {
        sp_model_path: &'a str,
        vocab_size: u32,
    }

    #[derive(Serialize)]
    struct CharMeta {
        vocab_size: u32,
    }

    fn write_meta(dir: &Path, sp_model_path: &str) -> PathBuf {
        let path = dir.join("meta.pkl");
        let bytes = serde_pickle::to_vec(
            &Meta {
                sp_model_path,
                vocab_size: 8000,
            },
            SerOptions::new(),
        )
        .expect("pickle");
        std::fs::write(&path, bytes).expect("write meta");
        path
    }

    #[test]
    fn reads_meta_fields() -> Result<()> {
        let dir = tempdir()?;
        let path = write_meta(dir.path(), "spm.model");
        let meta = load_meta(&path)?;
        assert_eq!(meta.sp_model_path, Some(Some("spm.model".to_string())));
        assert_eq!(meta.vocab_size, Some(8000));
        Ok(())
    }

    #[test]
    fn missing_key_is_distinguished() -> Result<()> {
        let bytes = serde_pickle::to_vec(&CharMeta { vocab_size: 65 }, SerOptions::new())?;
        let meta = parse_meta(&bytes)?;
        assert!(!meta.has_sp_model_path());
        assert_eq!(meta.vocab_size, Some(65));
        Ok(())
    }

    #[test]
    fn relative_path_resolves_against_meta_dir() -> Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("spm.model"), b"")?;
        std::fs::write(dir.path().join("other.model"), b"")?;
        let path = write_meta(dir.path(), "spm.model");
        let meta = load_meta(&path)?;
        let resolved = resolve_sp_model(&path, &meta)?;
        assert_eq!(resolved, Some(dir.path().join("spm.model")));
        Ok(())
    }

    #[test]
    fn dangling_path_falls_back_to_scan() -> Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("parannoul.model"), b"")?;
        std::fs::write(dir.path().join("notes.txt"), b"")?;
        let path = write_meta(dir.path(), "/nowhere/spm.model");
        let meta = load_meta(&path)?;
        let resolved = resolve_sp_model(&path, &meta)?;
        assert_eq!(resolved, Some(dir.path().join("parannoul.model")));
        Ok(())
    }

    #[test]
    fn nothing_to_resolve() -> Result<()> {
        let dir = tempdir()?;
        let path = write_meta(dir.path(), "spm.model");
        let meta = load_meta(&path)?;
        assert_eq!(resolve_sp_model(&path, &meta)?, None);
        Ok(())
    }

    #[test]
    fn garbage_is_error() {
        assert!(parse_meta(b"definitely not a pickle").is_err());
    }
}
